//! Integration tests for the PostgreSQL store.
//!
//! These tests require a running PostgreSQL server.
//! Run with: DATABASE_URL=postgres://localhost/factmill_test cargo test --test postgres_integration -- --ignored

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use factmill::config::CoordinatorConfig;
use factmill::extract::TaskCoordinator;
use factmill::store::{DataStore, PostgresStore};
use factmill::task::ExtractionTask;

fn get_test_database_url() -> String {
    std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for integration tests")
}

async fn create_test_store() -> PostgresStore {
    PostgresStore::connect(&get_test_database_url())
        .await
        .expect("Should connect to test database")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_integration -- --ignored
async fn test_cursor_query_roundtrip() {
    let store = create_test_store().await;

    store
        .execute("DROP TABLE IF EXISTS fm_it_words")
        .await
        .unwrap();
    store
        .execute("CREATE TABLE fm_it_words (id int, word text)")
        .await
        .unwrap();
    let inserted = store
        .execute("INSERT INTO fm_it_words SELECT g, 'w' || g FROM generate_series(1, 500) g")
        .await
        .unwrap();
    assert_eq!(inserted, 500);

    // Fetch size smaller than the row count forces multiple cursor pages.
    let mut stream = store
        .query_records("SELECT id, word FROM fm_it_words ORDER BY id", 64)
        .await
        .unwrap();

    let mut count = 0i64;
    while let Some(record) = stream.next().await {
        let record = record.unwrap();
        count += 1;
        assert_eq!(record["id"].as_i64().unwrap(), count);
        assert_eq!(record["word"].as_str().unwrap(), format!("w{}", count));
    }
    assert_eq!(count, 500);
}

#[tokio::test]
#[ignore]
async fn test_copy_append_and_analyze() {
    let store = create_test_store().await;

    store
        .execute("DROP TABLE IF EXISTS fm_it_copy")
        .await
        .unwrap();
    store
        .execute("CREATE TABLE fm_it_copy (id int, word text)")
        .await
        .unwrap();

    let records = vec![
        json!({ "id": 1, "word": "alpha" }),
        json!({ "id": 2, "word": "tab\tand\nnewline" }),
        json!({ "id": 3, "word": null }),
    ];
    store.append_records("fm_it_copy", &records).await.unwrap();
    store.analyze("fm_it_copy").await.unwrap();

    let mut stream = store
        .query_records("SELECT id, word FROM fm_it_copy ORDER BY id", 16)
        .await
        .unwrap();

    let mut rows = Vec::new();
    while let Some(record) = stream.next().await {
        rows.push(record.unwrap());
    }
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1]["word"].as_str().unwrap(), "tab\tand\nnewline");
    assert!(rows[2]["word"].is_null());
}

#[tokio::test]
#[ignore]
async fn test_streaming_task_end_to_end() {
    let store = create_test_store().await;

    store
        .execute("DROP TABLE IF EXISTS fm_it_e2e_src")
        .await
        .unwrap();
    store
        .execute("DROP TABLE IF EXISTS fm_it_e2e_dst")
        .await
        .unwrap();
    store
        .execute("CREATE TABLE fm_it_e2e_src (id int, word text)")
        .await
        .unwrap();
    store
        .execute("CREATE TABLE fm_it_e2e_dst (id int, word text)")
        .await
        .unwrap();
    store
        .execute("INSERT INTO fm_it_e2e_src SELECT g, 'w' || g FROM generate_series(1, 100) g")
        .await
        .unwrap();

    let task = ExtractionTask::new("e2e", "cat")
        .with_input_query("SELECT id, word FROM fm_it_e2e_src")
        .with_output_relation("fm_it_e2e_dst")
        .with_parallelism(2)
        .with_input_batch_size(10)
        .with_output_batch_size(30);

    let store = Arc::new(store);
    let report = TaskCoordinator::new(store.clone(), CoordinatorConfig::default())
        .run(&task)
        .await
        .unwrap();

    assert_eq!(report.records_in, 100);
    assert_eq!(report.records_out, 100);

    let mut stream = store
        .query_records("SELECT count(*) AS n FROM fm_it_e2e_dst", 1)
        .await
        .unwrap();
    let row = stream.next().await.unwrap().unwrap();
    assert_eq!(row["n"].as_i64().unwrap(), 100);
}
