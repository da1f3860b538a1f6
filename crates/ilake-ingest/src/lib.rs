//! Paginated incident fetch + bronze landing.
//!
//! The fetch loop and the bronze write are deliberately retry-free: a
//! failed run leaves pages without a manifest, which the transform
//! phase treats as nonexistent.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ilake_core::{
    bronze_run_prefix, format_run_id, manifest_object_key, page_object_key, Manifest,
    ManifestStorage, Page, MANIFEST_FORMAT,
};
use ilake_storage::ObjectStore;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ilake-ingest";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One paged read against the source API.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, limit: u64, offset: u64) -> Result<JsonValue, FetchError>;
}

/// reqwest-backed source speaking the ServiceNow-style paging params.
#[derive(Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
    endpoint_url: String,
}

impl HttpPageSource {
    pub fn new(
        endpoint_url: impl Into<String>,
        timeout: Duration,
        use_env_proxy: bool,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(timeout);
        if !use_env_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, limit: u64, offset: u64) -> Result<JsonValue, FetchError> {
        let response = self
            .client
            .get(&self.endpoint_url)
            .query(&[
                ("sysparm_limit", limit.to_string()),
                ("sysparm_offset", offset.to_string()),
                ("sysparm_display_value", "true".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPages {
    pub pages: Vec<Page>,
    pub total_records: u64,
}

/// Drives the paged read until the record cap, a short page, or an
/// empty page. Every fetched payload is kept, empty pages included.
pub async fn fetch_incident_pages(
    source: &dyn PageSource,
    page_size: u64,
    max_records: u64,
) -> Result<FetchedPages, FetchError> {
    let mut pages = Vec::new();
    let mut offset = 0u64;
    let mut total_records = 0u64;

    while total_records < max_records {
        let request_limit = page_size.min(max_records - total_records);
        let payload = source.fetch_page(request_limit, offset).await?;
        let page = Page::new(payload);
        let batch_count = page.record_count() as u64;
        debug!(offset, request_limit, batch_count, "fetched page");
        pages.push(page);

        // A zero-size page means there is nothing left to read.
        if batch_count == 0 {
            break;
        }

        total_records += batch_count;

        // A short page means the source has no more records.
        if batch_count < request_limit {
            break;
        }

        offset += request_limit;
    }

    Ok(FetchedPages {
        pages,
        total_records,
    })
}

#[derive(Debug, Clone)]
pub struct BronzeRunRef {
    pub run_id: String,
    pub run_prefix: String,
}

/// Lands one run under its timestamp partition: page objects in fetch
/// order first, then the manifest. Nothing is cleaned up on failure.
pub async fn save_raw_pages(
    store: &dyn ObjectStore,
    pages: &[Page],
    endpoint_url: &str,
    total_records: u64,
    prefix_root: &str,
    run_started_at: DateTime<Utc>,
) -> anyhow::Result<BronzeRunRef> {
    let run_id = format_run_id(run_started_at);
    let run_prefix = bronze_run_prefix(prefix_root, &run_id);

    for (idx, page) in pages.iter().enumerate() {
        let key = page_object_key(&run_prefix, idx + 1);
        let bytes = serde_json::to_vec(&page.payload)
            .with_context(|| format!("serializing bronze page {key}"))?;
        store
            .put(&key, bytes, "application/json")
            .await
            .with_context(|| format!("writing bronze page {key}"))?;
    }

    let manifest = Manifest {
        endpoint_url: endpoint_url.to_string(),
        run_id: run_id.clone(),
        page_count: pages.len() as u64,
        record_count: total_records,
        saved_at_utc: Utc::now(),
        format: MANIFEST_FORMAT.to_string(),
        storage: ManifestStorage {
            bucket: store.bucket().to_string(),
            prefix: run_prefix.clone(),
        },
    };
    let manifest_key = manifest_object_key(&run_prefix);
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing bronze manifest")?;
    store
        .put(&manifest_key, manifest_bytes, "application/json")
        .await
        .with_context(|| format!("writing bronze manifest {manifest_key}"))?;

    debug!(%run_id, pages = pages.len(), total_records, "bronze run written");
    Ok(BronzeRunRef { run_id, run_prefix })
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub output_uri: String,
    pub record_count: u64,
    pub endpoint_url: String,
    pub run_id: String,
}

/// Full ingestion pass: paginate the source, land the run in bronze.
pub async fn run_ingestion(
    store: &dyn ObjectStore,
    source: &dyn PageSource,
    endpoint_url: &str,
    page_size: u64,
    max_records: u64,
    prefix_root: &str,
) -> anyhow::Result<IngestSummary> {
    let fetched = fetch_incident_pages(source, page_size, max_records).await?;
    let run = save_raw_pages(
        store,
        &fetched.pages,
        endpoint_url,
        fetched.total_records,
        prefix_root,
        Utc::now(),
    )
    .await?;

    Ok(IngestSummary {
        output_uri: store.object_uri(&run.run_prefix),
        record_count: fetched.total_records,
        endpoint_url: endpoint_url.to_string(),
        run_id: run.run_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ilake_storage::MemoryObjectStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn page_payload(count: usize, offset: u64) -> JsonValue {
        let records: Vec<JsonValue> = (0..count)
            .map(|i| json!({"sys_id": format!("id-{}", offset as usize + i)}))
            .collect();
        json!({ "result": records })
    }

    /// Replays a fixed script of payloads and records the paging params.
    struct ScriptedSource {
        script: Mutex<Vec<JsonValue>>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<JsonValue>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, limit: u64, offset: u64) -> Result<JsonValue, FetchError> {
            self.calls.lock().expect("calls lock").push((limit, offset));
            let mut script = self.script.lock().expect("script lock");
            if script.is_empty() {
                return Ok(json!({ "result": [] }));
            }
            Ok(script.remove(0))
        }
    }

    /// Always returns exactly as many records as requested.
    struct UnlimitedSource {
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl UnlimitedSource {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl PageSource for UnlimitedSource {
        async fn fetch_page(&self, limit: u64, offset: u64) -> Result<JsonValue, FetchError> {
            self.calls.lock().expect("calls lock").push((limit, offset));
            Ok(page_payload(limit as usize, offset))
        }
    }

    #[tokio::test]
    async fn short_page_terminates_after_one_fetch() {
        let source = ScriptedSource::new(vec![page_payload(3, 0)]);
        let fetched = fetch_incident_pages(&source, 10, 100).await.expect("fetch");

        assert_eq!(fetched.pages.len(), 1);
        assert_eq!(fetched.total_records, 3);
        assert_eq!(source.calls(), vec![(10, 0)]);
    }

    #[tokio::test]
    async fn exact_cap_multiple_fetches_cap_over_page_size_pages() {
        let source = UnlimitedSource::new();
        let fetched = fetch_incident_pages(&source, 5, 20).await.expect("fetch");

        assert_eq!(fetched.pages.len(), 4);
        assert_eq!(fetched.total_records, 20);
        assert_eq!(source.calls(), vec![(5, 0), (5, 5), (5, 10), (5, 15)]);
    }

    #[tokio::test]
    async fn final_request_is_clamped_to_remaining_cap() {
        let source = UnlimitedSource::new();
        let fetched = fetch_incident_pages(&source, 10, 25).await.expect("fetch");

        assert_eq!(fetched.pages.len(), 3);
        assert_eq!(fetched.total_records, 25);
        assert_eq!(source.calls(), vec![(10, 0), (10, 10), (5, 20)]);
    }

    #[tokio::test]
    async fn zero_cap_issues_no_requests() {
        let source = UnlimitedSource::new();
        let fetched = fetch_incident_pages(&source, 10, 0).await.expect("fetch");

        assert!(fetched.pages.is_empty());
        assert_eq!(fetched.total_records, 0);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_page_is_recorded_then_loop_ends() {
        let source = ScriptedSource::new(vec![page_payload(10, 0), json!({"result": []})]);
        let fetched = fetch_incident_pages(&source, 10, 100).await.expect("fetch");

        assert_eq!(fetched.pages.len(), 2);
        assert_eq!(fetched.pages[1].record_count(), 0);
        assert_eq!(fetched.total_records, 10);
    }

    #[tokio::test]
    async fn http_failure_propagates_immediately() {
        struct FailingSource;

        #[async_trait]
        impl PageSource for FailingSource {
            async fn fetch_page(&self, _limit: u64, _offset: u64) -> Result<JsonValue, FetchError> {
                Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://example.invalid/incident".to_string(),
                })
            }
        }

        let err = fetch_incident_pages(&FailingSource, 10, 100)
            .await
            .expect_err("must fail");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn bronze_run_writes_pages_then_manifest_last() {
        let store = MemoryObjectStore::new("lake");
        let pages = vec![Page::new(page_payload(2, 0)), Page::new(page_payload(1, 2))];
        let started_at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 30, 5).single().expect("ts");

        let run = save_raw_pages(&store, &pages, "https://src/incident", 3, "bronze", started_at)
            .await
            .expect("save");

        assert_eq!(run.run_id, "20260307T093005Z");
        let log = store.put_log().await;
        assert_eq!(
            log,
            vec![
                format!("{}/incidents_raw_page_001.json", run.run_prefix),
                format!("{}/incidents_raw_page_002.json", run.run_prefix),
                format!("{}/manifest.json", run.run_prefix),
            ]
        );

        let manifest: Manifest = serde_json::from_slice(
            &store
                .get(&format!("{}/manifest.json", run.run_prefix))
                .await
                .expect("manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest.page_count, 2);
        assert_eq!(manifest.record_count, 3);
        assert_eq!(manifest.run_id, run.run_id);
        assert_eq!(manifest.storage.bucket, "lake");
        assert_eq!(manifest.storage.prefix, run.run_prefix);
        assert_eq!(manifest.format, MANIFEST_FORMAT);
    }

    #[tokio::test]
    async fn repeated_runs_land_in_disjoint_partitions() {
        let store = MemoryObjectStore::new("lake");
        let pages = vec![Page::new(page_payload(1, 0))];
        let first_at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 0, 0).single().expect("ts");
        let second_at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 0, 1).single().expect("ts");

        let first = save_raw_pages(&store, &pages, "https://src/incident", 1, "bronze", first_at)
            .await
            .expect("first save");
        let keys_after_first = store.keys().await;

        let second = save_raw_pages(&store, &pages, "https://src/incident", 1, "bronze", second_at)
            .await
            .expect("second save");

        assert_ne!(first.run_id, second.run_id);
        let keys = store.keys().await;
        // Every object from the first run is still present, untouched.
        for key in &keys_after_first {
            assert!(keys.contains(key));
        }
        assert_eq!(keys.len(), keys_after_first.len() * 2);
        assert!(keys
            .iter()
            .filter(|k| k.contains(&second.run_id))
            .all(|k| !k.contains(&first.run_id)));
    }

    #[tokio::test]
    async fn manifest_counts_match_pages_for_empty_run() {
        let store = MemoryObjectStore::new("lake");
        let started_at = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).single().expect("ts");

        let run = save_raw_pages(&store, &[], "https://src/incident", 0, "bronze", started_at)
            .await
            .expect("save");

        let manifest: Manifest = serde_json::from_slice(
            &store
                .get(&format!("{}/manifest.json", run.run_prefix))
                .await
                .expect("manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest.page_count, 0);
        assert_eq!(manifest.record_count, 0);
        assert_eq!(store.put_log().await.len(), 1);
    }
}
