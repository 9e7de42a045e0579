use statement_reconciler::{
    config::AppConfig,
    pipeline::{DocumentPipeline, PipelineServices},
    ReconciliationStatus,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let blob_names: Vec<String> = std::env::args().skip(1).collect();
    if blob_names.is_empty() {
        eprintln!("usage: reconciler <blob-name> [<blob-name> ...]");
        std::process::exit(2);
    }

    let config = AppConfig::from_env()?;
    let pipeline = DocumentPipeline::new(
        PipelineServices::from_config(&config)?,
        config.pipeline.clone(),
    );

    info!(documents = blob_names.len(), "Statement reconciler starting");

    match pipeline.process(&blob_names).await {
        Ok(report) => {
            println!("\n=== RECONCILIATION RESULT ===");
            println!("Request ID: {}", report.request_id);
            println!("Workbook: {}", report.export.url);
            println!("Link expires: {}", report.export.expires_at.to_rfc3339());

            for doc in &report.documents {
                let outcome = &doc.outcome;
                let status = match outcome.status {
                    ReconciliationStatus::Reconciled => "reconciled".to_string(),
                    ReconciliationStatus::Exhausted => format!(
                        "unreconciled ({} mismatch(es))",
                        outcome.check.mismatches.len()
                    ),
                };
                println!(
                    "\n{} [{}]: {} after {} attempt(s)",
                    doc.document.id,
                    doc.metadata.company_name.as_deref().unwrap_or("unknown company"),
                    status,
                    outcome.attempts
                );
                for mismatch in &outcome.check.mismatches {
                    println!(
                        "  ! {}: expected {} declared {} (delta {})",
                        mismatch.line_item, mismatch.expected, mismatch.actual, mismatch.delta
                    );
                }
                println!("  Trace:");
                for (i, step) in outcome.trace.iter().enumerate() {
                    println!("    {}: {}", i + 1, step);
                }
            }

            info!(elapsed_ms = report.execution_time_ms, "Reconciliation complete");
            Ok(())
        }
        Err(e) => {
            eprintln!("Reconciliation failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
