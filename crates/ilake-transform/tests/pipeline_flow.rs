//! End-to-end bronze→silver flow over the in-memory store: ingest a
//! run, transform it, ingest a newer version of one incident, and
//! check that the second transform merges latest-wins.

use chrono::{TimeZone, Utc};
use ilake_core::{Page, SILVER_OBJECT_KEY};
use ilake_ingest::save_raw_pages;
use ilake_storage::{MemoryObjectStore, ObjectStore};
use ilake_transform::{run_transform, silver_from_parquet_bytes, Cell};
use serde_json::json;

fn page(records: serde_json::Value) -> Page {
    Page::new(json!({ "result": records }))
}

async fn land_run(
    store: &MemoryObjectStore,
    records: serde_json::Value,
    started_at: chrono::DateTime<Utc>,
) {
    let pages = vec![page(records)];
    let total = pages[0].record_count() as u64;
    save_raw_pages(store, &pages, "https://src/incident", total, "bronze", started_at)
        .await
        .expect("bronze write");
}

#[tokio::test]
async fn transform_merges_latest_run_into_silver() {
    let store = MemoryObjectStore::new("lake");

    land_run(
        &store,
        json!([
            {
                "sys_id": "inc-1",
                "sys_updated_on": "2026-03-01 08:00:00",
                "state": {"value": "1", "display_value": "New"},
                "active": "true"
            },
            {
                "sys_id": "inc-2",
                "sys_updated_on": "2026-03-01 09:00:00",
                "state": {"value": "1", "display_value": "New"},
                "active": "true"
            }
        ]),
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("ts"),
    )
    .await;

    let first = run_transform(&store, "bronze").await.expect("first transform");
    assert_eq!(first.new_rows, 2);
    assert_eq!(first.final_rows, 2);
    assert_eq!(first.bronze_run_id, "20260301T100000Z");

    // A later run updates inc-1 only; inc-2 must survive the merge.
    land_run(
        &store,
        json!([
            {
                "sys_id": "inc-1",
                "sys_updated_on": "2026-03-02 08:00:00",
                "state": {"value": "6", "display_value": "Resolved"},
                "active": "false"
            }
        ]),
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().expect("ts"),
    )
    .await;

    let second = run_transform(&store, "bronze").await.expect("second transform");
    assert_eq!(second.new_rows, 1);
    assert_eq!(second.final_rows, 2);
    assert_eq!(second.bronze_run_id, "20260302T100000Z");

    let silver =
        silver_from_parquet_bytes(store.get(SILVER_OBJECT_KEY).await.expect("silver object"))
            .expect("silver frame");
    let col = |name: &str| silver.column_index(name).expect("column");

    let row_for = |id: &str| {
        silver
            .rows
            .iter()
            .find(|row| row[col("sys_id")] == Cell::Text(id.to_string()))
            .expect("row")
    };

    let inc_1 = row_for("inc-1");
    assert_eq!(inc_1[col("state")], Cell::Text("Resolved".to_string()));
    assert_eq!(inc_1[col("active")], Cell::Bool(false));
    assert_eq!(
        inc_1[col("sys_updated_on")],
        Cell::Timestamp(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("ts"))
    );
    assert_eq!(inc_1[col("bronze_run_id")], Cell::Text("20260302T100000Z".to_string()));

    let inc_2 = row_for("inc-2");
    assert_eq!(inc_2[col("state")], Cell::Text("New".to_string()));
    assert_eq!(inc_2[col("bronze_run_id")], Cell::Text("20260301T100000Z".to_string()));
}

#[tokio::test]
async fn transform_rejects_an_empty_bronze_run() {
    let store = MemoryObjectStore::new("lake");
    land_run(
        &store,
        json!([]),
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("ts"),
    )
    .await;

    let err = run_transform(&store, "bronze").await.expect_err("empty run");
    assert!(err.to_string().contains("zero records"));
    // The silver object must not have been touched.
    assert!(store.get(SILVER_OBJECT_KEY).await.is_err());
}
