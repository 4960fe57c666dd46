//! In-process data store.
//!
//! Backs tests, demos and file-only pipelines. Relations are plain vectors
//! of records; every bulk append is recorded so callers can assert batch
//! boundaries, not just final contents.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::StoreError;

use super::{DataStore, Record, RecordStream};

#[derive(Default)]
struct Inner {
    relations: HashMap<String, Vec<Record>>,
    appends: Vec<(String, usize)>,
    executed: Vec<String>,
    analyzed: Vec<String>,
    failing: HashSet<String>,
    streaming_disabled: bool,
}

/// In-memory [`DataStore`] backend.
///
/// Cloning is cheap and shares the underlying state. Queries interpret the
/// query text as a bare relation name and stream a snapshot of its records.
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents of `relation` with `records`.
    pub fn seed(&self, relation: impl Into<String>, records: Vec<Record>) {
        let mut inner = self.inner.lock().unwrap();
        inner.relations.insert(relation.into(), records);
    }

    /// Returns a copy of the records currently in `relation`.
    pub fn records(&self, relation: &str) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner.relations.get(relation).cloned().unwrap_or_default()
    }

    /// Returns the size of every append made to `relation`, in order.
    pub fn append_sizes(&self, relation: &str) -> Vec<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .appends
            .iter()
            .filter(|(rel, _)| rel == relation)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Returns the statements passed to `execute`, in order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }

    /// Returns the relations passed to `analyze`, in order.
    pub fn analyzed(&self) -> Vec<String> {
        self.inner.lock().unwrap().analyzed.clone()
    }

    /// Makes every future append to `relation` fail.
    pub fn fail_appends_to(&self, relation: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing.insert(relation.into());
    }

    /// Makes `supports_streaming` report false, like a driver without a
    /// paged read path.
    pub fn disable_streaming(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.streaming_disabled = true;
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    fn supports_streaming(&self) -> bool {
        !self.inner.lock().unwrap().streaming_disabled
    }

    async fn query_records(
        &self,
        query: &str,
        _batch_hint: usize,
    ) -> Result<RecordStream, StoreError> {
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            inner
                .relations
                .get(query.trim())
                .cloned()
                .ok_or_else(|| StoreError::UnknownRelation(query.trim().to_string()))?
        };

        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn append_records(&self, relation: &str, records: &[Record]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(relation) {
            return Err(StoreError::AppendFailed {
                relation: relation.to_string(),
                message: "append failure injected".to_string(),
            });
        }

        inner.appends.push((relation.to_string(), records.len()));
        inner
            .relations
            .entry(relation.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.executed.push(sql.to_string());
        Ok(0)
    }

    async fn analyze(&self, relation: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.analyzed.push(relation.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_streams_seeded_records_in_order() {
        let store = MemoryStore::new();
        store.seed("sentences", vec![json!({"id": 1}), json!({"id": 2})]);

        let records: Vec<Record> = store
            .query_records("sentences", 100)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[tokio::test]
    async fn test_query_unknown_relation_fails() {
        let store = MemoryStore::new();
        let err = store.query_records("missing", 10).await.err().unwrap();
        assert!(matches!(err, StoreError::UnknownRelation(_)));
    }

    #[tokio::test]
    async fn test_append_records_batches() {
        let store = MemoryStore::new();
        store
            .append_records("out", &[json!([1]), json!([2])])
            .await
            .unwrap();
        store.append_records("out", &[json!([3])]).await.unwrap();

        assert_eq!(store.append_sizes("out"), vec![2, 1]);
        assert_eq!(store.records("out"), vec![json!([1]), json!([2]), json!([3])]);
    }

    #[tokio::test]
    async fn test_append_failure_injection() {
        let store = MemoryStore::new();
        store.fail_appends_to("out");

        let err = store.append_records("out", &[json!([1])]).await.err().unwrap();
        assert!(matches!(err, StoreError::AppendFailed { .. }));
        assert!(store.append_sizes("out").is_empty());
    }

    #[test]
    fn test_streaming_support_can_be_disabled() {
        let store = MemoryStore::new();
        assert!(store.supports_streaming());
        store.disable_streaming();
        assert!(!store.supports_streaming());
    }

    #[tokio::test]
    async fn test_execute_and_analyze_are_recorded() {
        let store = MemoryStore::new();
        store.execute("TRUNCATE out").await.unwrap();
        store.analyze("out").await.unwrap();

        assert_eq!(store.executed(), vec!["TRUNCATE out".to_string()]);
        assert_eq!(store.analyzed(), vec!["out".to_string()]);
    }
}
