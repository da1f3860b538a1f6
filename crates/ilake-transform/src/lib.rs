//! Bronze-to-silver transform: latest-run selection, flattening, type
//! coercion, and the latest-wins merge into the silver parquet object.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{
    Array, ArrayRef, BooleanArray, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use ilake_core::{bronze_root, MANIFEST_OBJECT, PAGE_MARKER, RUN_PARTITION, SILVER_OBJECT_KEY};
use ilake_storage::{ObjectStore, StoreError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ilake-transform";

pub const IDENTITY_COLUMN: &str = "sys_id";
pub const VERSION_COLUMN: &str = "sys_updated_on";
pub const REQUIRED_COLUMNS: [&str; 2] = [IDENTITY_COLUMN, VERSION_COLUMN];
pub const DATETIME_COLUMNS: [&str; 7] = [
    "sys_updated_on",
    "opened_at",
    "resolved_at",
    "closed_at",
    "sys_created_on",
    "due_date",
    "activity_due",
];
pub const BOOLEAN_COLUMN: &str = "active";
pub const RUN_ID_COLUMN: &str = "bronze_run_id";
pub const INGESTED_AT_COLUMN: &str = "ingested_at_utc";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no bronze manifest objects found")]
    NoManifests,
    #[error("no bronze page objects found for run: {run_prefix}")]
    RunWithoutPages { run_prefix: String },
    #[error("bronze page {key} is not valid json: {source}")]
    PageParse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("bronze run contains zero records")]
    EmptyBronze,
    #[error("missing required column(s) for silver upsert: {0:?}")]
    MissingColumns(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The latest complete bronze run: manifest presence is the
/// completeness signal, manifest key order is chronological order.
#[derive(Debug, Clone)]
pub struct BronzeRun {
    pub run_prefix: String,
    pub run_id: String,
    pub page_keys: Vec<String>,
}

pub async fn latest_bronze_run(
    store: &dyn ObjectStore,
    prefix_root: &str,
) -> Result<BronzeRun, TransformError> {
    let bronze_prefix = format!("{}/", bronze_root(prefix_root));
    let latest_manifest = store
        .list(&bronze_prefix)
        .await?
        .into_iter()
        .filter(|key| key.ends_with(MANIFEST_OBJECT))
        .max()
        .ok_or(TransformError::NoManifests)?;

    let run_prefix = latest_manifest
        .rsplit_once('/')
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_default();
    let run_id = run_prefix
        .split(RUN_PARTITION)
        .last()
        .unwrap_or("")
        .to_string();

    let mut page_keys: Vec<String> = store
        .list(&format!("{run_prefix}/"))
        .await?
        .into_iter()
        .filter(|key| key.ends_with(".json") && key.contains(PAGE_MARKER))
        .collect();
    page_keys.sort();

    if page_keys.is_empty() {
        return Err(TransformError::RunWithoutPages { run_prefix });
    }

    debug!(%run_id, pages = page_keys.len(), "selected bronze run");
    Ok(BronzeRun {
        run_prefix,
        run_id,
        page_keys,
    })
}

/// Reads every page of a run and concatenates the record lists,
/// preserving page order then within-page order.
pub async fn read_bronze_records(
    store: &dyn ObjectStore,
    page_keys: &[String],
) -> Result<Vec<JsonValue>, TransformError> {
    let mut records = Vec::new();
    for key in page_keys {
        let bytes = store.get(key).await?;
        let payload: JsonValue =
            serde_json::from_slice(&bytes).map_err(|source| TransformError::PageParse {
                key: key.clone(),
                source,
            })?;
        if let Some(batch) = payload.get("result").and_then(JsonValue::as_array) {
            records.extend(batch.iter().cloned());
        }
    }
    Ok(records)
}

/// Tabular projection of the raw records: columns are the union of all
/// record keys in first-seen order, missing cells are null.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl FlatFrame {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// Collapses value/display-value objects to their display value; an
/// object cell without one passes through unchanged, so genuinely
/// structured columns survive.
pub fn flatten_records(records: &[JsonValue]) -> Result<FlatFrame, TransformError> {
    if records.is_empty() {
        return Err(TransformError::EmptyBronze);
    }

    let mut columns: Vec<String> = Vec::new();
    for record in records {
        if let Some(object) = record.as_object() {
            for key in object.keys() {
                if !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    let mut rows: Vec<Vec<JsonValue>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| {
                    record
                        .as_object()
                        .and_then(|object| object.get(column))
                        .cloned()
                        .unwrap_or(JsonValue::Null)
                })
                .collect()
        })
        .collect();

    for col_idx in 0..columns.len() {
        if !rows.iter().any(|row| row[col_idx].is_object()) {
            continue;
        }
        for row in &mut rows {
            if let Some(display) = row[col_idx].get("display_value").cloned() {
                row[col_idx] = display;
            }
        }
    }

    Ok(FlatFrame { columns, rows })
}

/// One typed silver value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SilverFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl SilverFrame {
    pub fn empty_with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Boolean,
    Timestamp,
}

fn column_kind(name: &str) -> ColumnKind {
    if DATETIME_COLUMNS.contains(&name) || name == INGESTED_AT_COLUMN {
        ColumnKind::Timestamp
    } else if name == BOOLEAN_COLUMN {
        ColumnKind::Boolean
    } else {
        ColumnKind::Text
    }
}

const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d/%m/%Y %H:%M",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y"];

/// Day-first convention for ambiguous dates; naive values are taken as
/// UTC. Anything unparseable is null, never an error.
pub fn parse_datetime_dayfirst(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn coerce_cell(column: &str, value: &JsonValue) -> Cell {
    match column_kind(column) {
        ColumnKind::Timestamp => json_text(value)
            .and_then(|text| parse_datetime_dayfirst(&text))
            .map(Cell::Timestamp)
            .unwrap_or(Cell::Null),
        ColumnKind::Boolean => match value {
            JsonValue::Bool(flag) => Cell::Bool(*flag),
            JsonValue::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Cell::Bool(true),
                "false" => Cell::Bool(false),
                _ => Cell::Null,
            },
            _ => Cell::Null,
        },
        ColumnKind::Text => match value {
            JsonValue::Null => Cell::Null,
            JsonValue::String(text) => Cell::Text(text.clone()),
            other => Cell::Text(other.to_string()),
        },
    }
}

/// Validates the identity/version schema gate, coerces the known date
/// and boolean columns, and stamps provenance on every row. Row count
/// is preserved.
pub fn build_silver(
    flat: &FlatFrame,
    bronze_run_id: &str,
    ingested_at: DateTime<Utc>,
) -> Result<SilverFrame, TransformError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| flat.column_index(required).is_none())
        .map(|required| required.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(TransformError::MissingColumns(missing));
    }

    let mut columns = flat.columns.clone();
    columns.push(RUN_ID_COLUMN.to_string());
    columns.push(INGESTED_AT_COLUMN.to_string());

    let rows = flat
        .rows
        .iter()
        .map(|flat_row| {
            let mut row: Vec<Cell> = flat_row
                .iter()
                .zip(&flat.columns)
                .map(|(value, column)| coerce_cell(column, value))
                .collect();
            row.push(Cell::Text(bronze_run_id.to_string()));
            row.push(Cell::Timestamp(ingested_at));
            row
        })
        .collect();

    Ok(SilverFrame { columns, rows })
}

fn aligned_rows(frame: &SilverFrame, columns: &[String]) -> Vec<Vec<Cell>> {
    let mapping: Vec<Option<usize>> = columns
        .iter()
        .map(|column| frame.column_index(column))
        .collect();
    frame
        .rows
        .iter()
        .map(|row| {
            mapping
                .iter()
                .map(|index| index.map(|i| row[i].clone()).unwrap_or(Cell::Null))
                .collect()
        })
        .collect()
}

/// Latest-wins reconciliation keyed by identity: per `sys_id`, keep the
/// row with the greatest version timestamp; a null version is treated
/// as the earliest possible instant; a tie goes to the later row in
/// existing-then-fresh order, so new data beats old on equal versions.
pub fn upsert_silver(
    existing: &SilverFrame,
    fresh: &SilverFrame,
) -> Result<SilverFrame, TransformError> {
    let mut columns = existing.columns.clone();
    for column in &fresh.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !columns.iter().any(|column| column == *required))
        .map(|required| required.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(TransformError::MissingColumns(missing));
    }
    let identity_idx = columns
        .iter()
        .position(|column| column == IDENTITY_COLUMN)
        .unwrap_or_default();
    let version_idx = columns
        .iter()
        .position(|column| column == VERSION_COLUMN)
        .unwrap_or_default();

    let mut order: Vec<String> = Vec::new();
    let mut winners: HashMap<String, (Vec<Cell>, Option<DateTime<Utc>>)> = HashMap::new();

    let candidates = aligned_rows(existing, &columns)
        .into_iter()
        .chain(aligned_rows(fresh, &columns));
    for row in candidates {
        let identity = match &row[identity_idx] {
            Cell::Text(id) => id.clone(),
            _ => String::new(),
        };
        let version = match &row[version_idx] {
            Cell::Timestamp(at) => Some(*at),
            _ => None,
        };
        match winners.entry(identity.clone()) {
            Entry::Vacant(slot) => {
                order.push(identity);
                slot.insert((row, version));
            }
            Entry::Occupied(mut slot) => {
                // None sorts below every Some, and >= lets the later
                // (fresh) row displace an equal-version incumbent.
                if version >= slot.get().1 {
                    slot.insert((row, version));
                }
            }
        }
    }

    let rows = order
        .into_iter()
        .filter_map(|identity| winners.remove(&identity))
        .map(|(row, _)| row)
        .collect();

    Ok(SilverFrame { columns, rows })
}

pub fn silver_to_parquet_bytes(frame: &SilverFrame) -> anyhow::Result<Vec<u8>> {
    let fields: Vec<ArrowField> = frame
        .columns
        .iter()
        .map(|name| match column_kind(name) {
            ColumnKind::Timestamp => ArrowField::new(
                name,
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                true,
            ),
            ColumnKind::Boolean => ArrowField::new(name, DataType::Boolean, true),
            ColumnKind::Text => ArrowField::new(name, DataType::Utf8, true),
        })
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Vec<ArrayRef> = frame
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| match column_kind(name) {
            ColumnKind::Timestamp => {
                let values: Vec<Option<i64>> = frame
                    .rows
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Timestamp(at) => Some(at.timestamp_micros()),
                        _ => None,
                    })
                    .collect();
                Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC")) as ArrayRef
            }
            ColumnKind::Boolean => {
                let values: Vec<Option<bool>> = frame
                    .rows
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Bool(flag) => Some(*flag),
                        _ => None,
                    })
                    .collect();
                Arc::new(BooleanArray::from(values)) as ArrayRef
            }
            ColumnKind::Text => {
                let values: Vec<Option<String>> = frame
                    .rows
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Text(text) => Some(text.clone()),
                        _ => None,
                    })
                    .collect();
                Arc::new(StringArray::from(values)) as ArrayRef
            }
        })
        .collect();

    let batch =
        RecordBatch::try_new(schema.clone(), arrays).context("building silver record batch")?;
    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, schema, None).context("opening silver parquet writer")?;
    writer.write(&batch).context("writing silver record batch")?;
    writer.close().context("closing silver parquet writer")?;
    Ok(buffer)
}

pub fn silver_from_parquet_bytes(bytes: Vec<u8>) -> anyhow::Result<SilverFrame> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .context("opening silver parquet")?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();
    let reader = builder.build().context("building silver parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("decoding silver record batch")?;
        for row_idx in 0..batch.num_rows() {
            let row = (0..batch.num_columns())
                .map(|col_idx| cell_from_array(batch.column(col_idx), row_idx))
                .collect();
            rows.push(row);
        }
    }
    Ok(SilverFrame { columns, rows })
}

fn cell_from_array(array: &ArrayRef, row: usize) -> Cell {
    if array.is_null(row) {
        return Cell::Null;
    }
    match array.data_type() {
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|strings| Cell::Text(strings.value(row).to_string()))
            .unwrap_or(Cell::Null),
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .map(|flags| Cell::Bool(flags.value(row)))
            .unwrap_or(Cell::Null),
        DataType::Timestamp(TimeUnit::Microsecond, _) => array
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|stamps| DateTime::from_timestamp_micros(stamps.value(row)))
            .map(Cell::Timestamp)
            .unwrap_or(Cell::Null),
        _ => Cell::Null,
    }
}

/// Missing or unreadable prior silver means "no existing data" — the
/// one local-recovery point in the pipeline.
pub async fn load_existing_silver(
    store: &dyn ObjectStore,
    key: &str,
    columns: &[String],
) -> SilverFrame {
    let bytes = match store.get(key).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound { .. }) => {
            debug!(key, "no existing silver object");
            return SilverFrame::empty_with_columns(columns.to_vec());
        }
        Err(err) => {
            warn!(key, error = %err, "existing silver unreadable, starting from empty");
            return SilverFrame::empty_with_columns(columns.to_vec());
        }
    };
    match silver_from_parquet_bytes(bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(key, error = %err, "existing silver undecodable, starting from empty");
            SilverFrame::empty_with_columns(columns.to_vec())
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformSummary {
    pub output_uri: String,
    pub bronze_run_id: String,
    pub new_rows: usize,
    pub final_rows: usize,
}

/// Full transform pass: latest bronze run → flatten → silver build →
/// merge with prior silver → snapshot overwrite of the silver object.
pub async fn run_transform(
    store: &dyn ObjectStore,
    prefix_root: &str,
) -> anyhow::Result<TransformSummary> {
    let run = latest_bronze_run(store, prefix_root).await?;
    let records = read_bronze_records(store, &run.page_keys).await?;
    let flat = flatten_records(&records)?;
    let fresh = build_silver(&flat, &run.run_id, Utc::now())?;
    let existing = load_existing_silver(store, SILVER_OBJECT_KEY, &fresh.columns).await;
    let merged = upsert_silver(&existing, &fresh)?;

    let bytes = silver_to_parquet_bytes(&merged)?;
    store
        .put(SILVER_OBJECT_KEY, bytes, "application/octet-stream")
        .await
        .context("writing silver object")?;

    Ok(TransformSummary {
        output_uri: store.object_uri(SILVER_OBJECT_KEY),
        bronze_run_id: run.run_id,
        new_rows: fresh.rows.len(),
        final_rows: merged.rows.len(),
    })
}
