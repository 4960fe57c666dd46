//! Input record streams.
//!
//! Builds the lazy record stream a task feeds from: either a paged store
//! query (rows as JSON objects) or a delimited text file (lines as JSON
//! arrays of string fields). Also hosts the line/record conversions shared
//! with the line-oriented style.

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

use crate::error::{ExtractionError, StoreError};
use crate::store::{DataStore, Record, RecordStream};
use crate::task::InputSource;

/// Opens the record stream for `source`.
pub async fn open(
    store: &dyn DataStore,
    source: &InputSource,
    batch_hint: usize,
) -> Result<RecordStream, ExtractionError> {
    match source {
        InputSource::Query { query } => store
            .query_records(query, batch_hint)
            .await
            .map_err(ExtractionError::InputError),
        InputSource::File { file, separator } => open_file(file, *separator).await,
    }
}

async fn open_file(path: &str, separator: char) -> Result<RecordStream, ExtractionError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ExtractionError::InputError(StoreError::Io(e)))?;

    let lines = LinesStream::new(BufReader::new(file).lines());
    let stream = lines.filter_map(move |result| {
        futures::future::ready(match result {
            Ok(line) if line.is_empty() => None,
            Ok(line) => Some(Ok(line_to_record(&line, separator))),
            Err(e) => Some(Err(StoreError::Io(e))),
        })
    });
    Ok(stream.boxed())
}

/// Splits a delimited line into a JSON array of string fields.
pub fn line_to_record(line: &str, separator: char) -> Record {
    Value::Array(
        line.split(separator)
            .map(|field| Value::String(field.to_string()))
            .collect(),
    )
}

/// Renders a record as one delimited line (no trailing newline).
///
/// Arrays keep their field order; objects emit values in key order. Nulls
/// become empty fields, nested structures their JSON text.
pub fn record_to_line(record: &Record, separator: char) -> String {
    let sep = separator.to_string();
    match record {
        Value::Array(items) => items.iter().map(field_text).collect::<Vec<_>>().join(&sep),
        Value::Object(map) => map.values().map(field_text).collect::<Vec<_>>().join(&sep),
        other => field_text(other),
    }
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_query_source_streams_store_records() {
        let store = MemoryStore::new();
        store.seed("articles", vec![json!({"id": 1}), json!({"id": 2})]);

        let source = InputSource::query("articles");
        let records: Vec<Record> = open(&store, &source, 100)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[tokio::test]
    async fn test_file_source_splits_lines_and_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a\tb\n\nc\td\n").unwrap();

        let store = MemoryStore::new();
        let source = InputSource::file(file.path().to_string_lossy());
        let records: Vec<Record> = open(&store, &source, 100)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records, vec![json!(["a", "b"]), json!(["c", "d"])]);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_input_error() {
        let store = MemoryStore::new();
        let source = InputSource::file("/definitely/not/here.tsv");
        let err = open(&store, &source, 100).await.err().unwrap();
        assert!(matches!(err, ExtractionError::InputError(_)));
    }

    #[test]
    fn test_line_to_record_custom_separator() {
        assert_eq!(
            line_to_record("x,y,,z", ','),
            json!(["x", "y", "", "z"])
        );
    }

    #[test]
    fn test_record_to_line_array() {
        let line = record_to_line(&json!([1, "x", null, true]), ',');
        assert_eq!(line, "1,x,,true");
    }

    #[test]
    fn test_record_to_line_object_uses_key_order() {
        let line = record_to_line(&json!({"b": 2, "a": "y"}), '\t');
        assert_eq!(line, "y\t2");
    }

    #[test]
    fn test_record_to_line_nested_json() {
        let line = record_to_line(&json!([{"k": 1}]), '\t');
        assert_eq!(line, "{\"k\":1}");
    }
}
