//! Environment-driven configuration
//!
//! Required endpoints and keys are collected first so every missing
//! variable is reported in one error.

use crate::error::PipelineError;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DOC_INTEL_MODEL: &str = "prebuilt-layout";
pub const DEFAULT_OPENAI_API_VERSION: &str = "2024-10-01-preview";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub connection_string: String,
    pub container: String,
}

#[derive(Debug, Clone)]
pub struct DocumentIntelligenceConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key: String,
    pub index: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
}

/// Knobs for the processing pipeline and reconciliation loop
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub rounding_epsilon: f64,
    pub retrieval_top_k: usize,
    pub context_top_k: usize,
    pub call_timeout: Duration,
    pub request_timeout: Duration,
    pub sas_expiry: Duration,
    pub classify_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rounding_epsilon: 0.01,
            retrieval_top_k: 8,
            context_top_k: 4,
            call_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(900),
            sas_expiry: Duration::from_secs(24 * 3600),
            classify_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub document_intelligence: DocumentIntelligenceConfig,
    pub search: SearchConfig,
    pub openai: OpenAiConfig,
    pub pipeline: PipelineSettings,
    pub port: u16,
    pub allowed_origin: Option<String>,
    pub extraction_cache_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    /// Load from the process environment (after `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut required = |key: &'static str| -> String {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(v) => v.trim().to_string(),
                None => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let storage = StorageConfig {
            connection_string: required("AZURE_STORAGE_CONNECTION_STRING"),
            container: required("AZURE_STORAGE_CONTAINER_NAME"),
        };
        let doc_intel_endpoint = required("AZURE_DOC_INTEL_ENDPOINT");
        let doc_intel_key = required("AZURE_DOC_INTEL_API_KEY");
        let search = SearchConfig {
            endpoint: required("AZURE_SEARCH_ENDPOINT"),
            api_key: required("AZURE_SEARCH_API_KEY"),
            index: required("AZURE_SEARCH_INDEX"),
        };
        let openai_endpoint = required("AZURE_OPENAI_ENDPOINT");
        let openai_key = required("AZURE_OPENAI_API_KEY");
        let openai_deployment = required("AZURE_OPENAI_DEPLOYMENT_ID");

        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "missing environment variables: {}",
                missing.join(", ")
            )));
        }

        let optional = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            max_attempts: parse_or(&lookup, "RECONCILE_MAX_ATTEMPTS", defaults.max_attempts)?,
            rounding_epsilon: parse_or(
                &lookup,
                "RECONCILE_ROUNDING_EPSILON",
                defaults.rounding_epsilon,
            )?,
            retrieval_top_k: parse_or(&lookup, "RETRIEVAL_TOP_K", defaults.retrieval_top_k)?,
            context_top_k: parse_or(&lookup, "CONTEXT_TOP_K", defaults.context_top_k)?,
            call_timeout: Duration::from_secs(parse_or(&lookup, "CALL_TIMEOUT_SECS", 120u64)?),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                900u64,
            )?),
            sas_expiry: Duration::from_secs(parse_or(&lookup, "SAS_EXPIRY_HOURS", 24u64)? * 3600),
            classify_concurrency: parse_or(
                &lookup,
                "CLASSIFY_CONCURRENCY",
                defaults.classify_concurrency,
            )?,
        };

        if pipeline.max_attempts == 0 {
            return Err(PipelineError::Config(
                "RECONCILE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if pipeline.rounding_epsilon < 0.0 || !pipeline.rounding_epsilon.is_finite() {
            return Err(PipelineError::Config(
                "RECONCILE_ROUNDING_EPSILON must be a non-negative number".to_string(),
            ));
        }
        if pipeline.classify_concurrency == 0 || pipeline.retrieval_top_k == 0 {
            return Err(PipelineError::Config(
                "CLASSIFY_CONCURRENCY and RETRIEVAL_TOP_K must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            storage,
            document_intelligence: DocumentIntelligenceConfig {
                endpoint: doc_intel_endpoint,
                api_key: doc_intel_key,
                model: optional("AZURE_DOC_INTEL_MODEL")
                    .unwrap_or_else(|| DEFAULT_DOC_INTEL_MODEL.to_string()),
            },
            search,
            openai: OpenAiConfig {
                endpoint: openai_endpoint,
                api_key: openai_key,
                deployment: openai_deployment,
                api_version: optional("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_OPENAI_API_VERSION.to_string()),
            },
            pipeline,
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            allowed_origin: optional("ALLOWED_ORIGIN"),
            extraction_cache_dir: optional("EXTRACTION_CACHE_DIR").map(PathBuf::from),
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            PipelineError::Config(format!("{} has an invalid value: '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (
                "AZURE_STORAGE_CONNECTION_STRING",
                "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5;EndpointSuffix=core.windows.net",
            ),
            ("AZURE_STORAGE_CONTAINER_NAME", "reports"),
            ("AZURE_DOC_INTEL_ENDPOINT", "https://docintel.example.com"),
            ("AZURE_DOC_INTEL_API_KEY", "di-key"),
            ("AZURE_SEARCH_ENDPOINT", "https://search.example.com"),
            ("AZURE_SEARCH_API_KEY", "search-key"),
            ("AZURE_SEARCH_INDEX", "statements"),
            ("AZURE_OPENAI_ENDPOINT", "https://openai.example.com"),
            ("AZURE_OPENAI_API_KEY", "oa-key"),
            ("AZURE_OPENAI_DEPLOYMENT_ID", "gpt-4o"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<AppConfig> {
        AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&required_vars()).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.document_intelligence.model, "prebuilt-layout");
        assert_eq!(config.openai.api_version, "2024-10-01-preview");
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.rounding_epsilon, 0.01);
        assert_eq!(config.pipeline.sas_expiry, Duration::from_secs(86_400));
        assert!(config.allowed_origin.is_none());
        assert!(config.extraction_cache_dir.is_none());
    }

    #[test]
    fn test_missing_variables_reported_together() {
        let mut vars = required_vars();
        vars.remove("AZURE_SEARCH_INDEX");
        vars.remove("AZURE_OPENAI_API_KEY");

        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("AZURE_SEARCH_INDEX"));
        assert!(err.contains("AZURE_OPENAI_API_KEY"));
    }

    #[test]
    fn test_invalid_numbers_name_the_variable() {
        let mut vars = required_vars();
        vars.insert("RECONCILE_MAX_ATTEMPTS", "three");
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("RECONCILE_MAX_ATTEMPTS"));

        let mut vars = required_vars();
        vars.insert("RECONCILE_MAX_ATTEMPTS", "0");
        assert!(matches!(load(&vars), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let mut vars = required_vars();
        vars.insert("PORT", "8081");
        vars.insert("RECONCILE_ROUNDING_EPSILON", "0.5");
        vars.insert("ALLOWED_ORIGIN", "https://app.example.com");
        vars.insert("EXTRACTION_CACHE_DIR", "/tmp/layouts");

        let config = load(&vars).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.pipeline.rounding_epsilon, 0.5);
        assert_eq!(config.allowed_origin.as_deref(), Some("https://app.example.com"));
        assert_eq!(config.extraction_cache_dir, Some(PathBuf::from("/tmp/layouts")));
    }
}
