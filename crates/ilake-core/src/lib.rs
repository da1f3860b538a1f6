//! Core domain model and configuration types for the incident lakehouse pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "ilake-core";

/// Serialization tag stored in every bronze manifest.
pub const MANIFEST_FORMAT: &str = "raw_json_pages";

/// One raw API response payload, kept verbatim from fetch to bronze write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub payload: JsonValue,
}

impl Page {
    pub fn new(payload: JsonValue) -> Self {
        Self { payload }
    }

    /// Records carried by this page (the payload's `result` list).
    pub fn records(&self) -> &[JsonValue] {
        self.payload
            .get("result")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.records().len()
    }
}

/// Bronze run metadata, written last so its presence implies a complete run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub endpoint_url: String,
    pub run_id: String,
    pub page_count: u64,
    pub record_count: u64,
    pub saved_at_utc: DateTime<Utc>,
    pub format: String,
    pub storage: ManifestStorage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStorage {
    pub bucket: String,
    pub prefix: String,
}

/// Compact UTC token identifying one ingestion run; lexicographic order
/// on these tokens is chronological order.
pub fn format_run_id(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y%m%dT%H%M%SZ").to_string()
}

// Bronze/silver storage layout. Page objects are index-named so their
// sorted order is fetch order; the manifest is the run's completeness
// marker and must be the last object written.
pub const PAGE_MARKER: &str = "incidents_raw_page_";
pub const MANIFEST_OBJECT: &str = "manifest.json";
pub const RUN_PARTITION: &str = "run_ts=";
pub const SILVER_OBJECT_KEY: &str = "silver/incidents/incidents.parquet";

pub fn bronze_root(prefix_root: &str) -> String {
    format!("{}/incidents_raw", prefix_root.trim_end_matches('/'))
}

pub fn bronze_run_prefix(prefix_root: &str, run_id: &str) -> String {
    format!("{}/{RUN_PARTITION}{run_id}", bronze_root(prefix_root))
}

/// Key of one bronze page object; `index` is 1-based fetch order.
pub fn page_object_key(run_prefix: &str, index: usize) -> String {
    format!("{run_prefix}/{PAGE_MARKER}{index:03}.json")
}

pub fn manifest_object_key(run_prefix: &str) -> String {
    format!("{run_prefix}/{MANIFEST_OBJECT}")
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub api_base_url: String,
    pub incident_path: String,
    pub page_size: u64,
    pub max_records: u64,
}

impl SourceConfig {
    /// Slash-normalized join of the API base URL and the incident path.
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            self.incident_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            use_env_proxy: false,
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root_dir: std::path::PathBuf,
    pub bucket: String,
    #[serde(default = "default_prefix_root")]
    pub prefix_root: String,
}

fn default_prefix_root() -> String {
    "bronze".to_string()
}
