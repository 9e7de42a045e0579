use statement_reconciler::{
    api::{start_server, ApiState, ServerOptions},
    config::AppConfig,
    pipeline::{DocumentPipeline, PipelineServices},
    rag::RagResponder,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    info!("Statement Reconciler - API Server");
    info!(
        port = config.port,
        container = %config.storage.container,
        index = %config.search.index,
        max_attempts = config.pipeline.max_attempts,
        "Configuration loaded"
    );

    // Create components
    let services = PipelineServices::from_config(&config)?;
    let rag = RagResponder::new(
        services.llm.clone(),
        services.index.clone(),
        config.pipeline.call_timeout,
    );
    let state = ApiState {
        store: services.store.clone(),
        pipeline: Arc::new(DocumentPipeline::new(services, config.pipeline.clone())),
        rag: Arc::new(rag),
        request_timeout: config.pipeline.request_timeout,
    };

    info!("Pipeline initialized");

    start_server(state, ServerOptions::from(&config), config.port).await?;

    Ok(())
}
