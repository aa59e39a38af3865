use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::models::schema::ValueType;
use crate::services::gemini::DEFAULT_BASE_URL;
use crate::services::template::{SchemaOptions, SheetScope};

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Address of the worker's Prometheus listener
    #[serde(default = "default_worker_metrics_addr")]
    #[garde(length(min = 1))]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    #[garde(range(min = 1, max = 100))]
    pub database_max_connections: u32,

    /// Redis connection string for job queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Bucket holding templates, documents and outputs
    #[garde(length(min = 1))]
    pub blob_bucket: String,

    /// S3-compatible endpoint URL
    #[garde(length(min = 1))]
    pub blob_endpoint: String,

    #[serde(default = "default_blob_region")]
    #[garde(length(min = 1))]
    pub blob_region: String,

    #[garde(length(min = 1))]
    pub blob_access_key: String,

    #[garde(length(min = 1))]
    pub blob_secret_key: String,

    #[garde(length(min = 1))]
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_model")]
    #[garde(length(min = 1))]
    pub gemini_model: String,

    #[serde(default = "default_gemini_base_url")]
    #[garde(length(min = 1))]
    pub gemini_base_url: String,

    /// Upper bound on a single generator call, in seconds
    #[serde(default = "default_generator_timeout_secs")]
    #[garde(range(min = 1, max = 600))]
    pub generator_timeout_secs: u64,

    /// How long a `processing` request may go without an outcome before a trigger may
    /// reset it. Defaults to twice the generator timeout plus a minute.
    #[garde(range(min = 1))]
    pub processing_lease_secs: Option<u64>,

    /// Characters of document text sent to the generator
    #[serde(default = "default_max_context_chars")]
    #[garde(range(min = 1000, max = 1_000_000))]
    pub max_context_chars: usize,

    #[serde(default)]
    #[garde(skip)]
    pub template_sheets: SheetScope,

    /// Fixed 1-based header row; detected when unset
    #[garde(range(min = 1))]
    pub template_header_row: Option<u32>,

    /// Fixed 1-based label column; detected when unset
    #[garde(range(min = 1))]
    pub template_label_column: Option<u32>,

    #[serde(default)]
    #[garde(skip)]
    pub template_default_value_type: ValueType,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_blob_region() -> String {
    "auto".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_gemini_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_generator_timeout_secs() -> u64 {
    120
}

fn default_max_context_chars() -> usize {
    50_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Builds the configuration from explicit `(KEY, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn processing_lease(&self) -> Duration {
        let secs = self
            .processing_lease_secs
            .unwrap_or(2 * self.generator_timeout_secs + 60);
        Duration::from_secs(secs)
    }

    pub fn schema_options(&self) -> SchemaOptions {
        SchemaOptions {
            sheets: self.template_sheets,
            header_row: self.template_header_row,
            label_column: self.template_label_column,
            default_value_type: self.template_default_value_type,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(String, String)> {
        [
            ("DATABASE_URL", "postgres://localhost/spreader"),
            ("REDIS_URL", "redis://localhost"),
            ("BLOB_BUCKET", "uploads"),
            ("BLOB_ENDPOINT", "http://localhost:9000"),
            ("BLOB_ACCESS_KEY", "access"),
            ("BLOB_SECRET_KEY", "secret"),
            ("GEMINI_API_KEY", "key"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn applies_defaults() {
        let config = AppConfig::from_vars(required()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.blob_region, "auto");
        assert_eq!(config.gemini_model, "gemini-2.5-flash");
        assert_eq!(config.generator_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_context_chars, 50_000);
        assert_eq!(config.processing_lease(), Duration::from_secs(300));

        let options = config.schema_options();
        assert_eq!(options.sheets, SheetScope::First);
        assert_eq!(options.header_row, None);
        assert_eq!(options.default_value_type, ValueType::Text);
    }

    #[test]
    fn reads_template_options() {
        let mut vars = required();
        vars.push(("TEMPLATE_SHEETS".into(), "all".into()));
        vars.push(("TEMPLATE_HEADER_ROW".into(), "3".into()));
        vars.push(("TEMPLATE_DEFAULT_VALUE_TYPE".into(), "number".into()));
        let options = AppConfig::from_vars(vars).unwrap().schema_options();
        assert_eq!(options.sheets, SheetScope::All);
        assert_eq!(options.header_row, Some(3));
        assert_eq!(options.default_value_type, ValueType::Number);
    }

    #[test]
    fn processing_lease_follows_generator_timeout() {
        let mut vars = required();
        vars.push(("GENERATOR_TIMEOUT_SECS".into(), "30".into()));
        let config = AppConfig::from_vars(vars.clone()).unwrap();
        assert_eq!(config.processing_lease(), Duration::from_secs(120));

        vars.push(("PROCESSING_LEASE_SECS".into(), "900".into()));
        let config = AppConfig::from_vars(vars).unwrap();
        assert_eq!(config.processing_lease(), Duration::from_secs(900));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut vars = required();
        vars.push(("GENERATOR_TIMEOUT_SECS".into(), "0".into()));
        assert!(matches!(
            AppConfig::from_vars(vars),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn reports_missing_variables() {
        assert!(matches!(
            AppConfig::from_vars(Vec::new()),
            Err(ConfigError::Env(_))
        ));
    }
}
