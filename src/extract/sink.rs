//! Output collection for streaming tasks.
//!
//! The sink is a single task per output relation: worker chunks from the
//! whole pool are serialized through its queue, parsed into records, and
//! appended in batches of exactly the configured size, with one final
//! partial flush when the input side closes. Producers are acknowledged
//! only after their chunk is parsed and any due append succeeded, which is
//! the output half of the task's backpressure.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ExtractionError;
use crate::store::{DataStore, Record};

/// One worker chunk and the acknowledgment that releases its producer.
pub type SinkItem = (Vec<String>, oneshot::Sender<()>);

/// Counters reported by a finished sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Records appended to the output relation.
    pub records: u64,
    /// Bulk appends issued.
    pub appends: u64,
}

/// Handle to a running sink task.
#[derive(Debug)]
pub struct SinkHandle {
    /// Chunk queue; dropping the last sender triggers the final flush.
    pub tx: mpsc::Sender<SinkItem>,
    /// Resolves with the sink's counters, or the error that aborted it.
    pub task: JoinHandle<Result<SinkReport, ExtractionError>>,
}

/// Starts the sink task for one output relation.
pub fn spawn(store: Arc<dyn DataStore>, relation: String, batch_size: usize) -> SinkHandle {
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(run(store, relation, batch_size, rx));
    SinkHandle { tx, task }
}

async fn run(
    store: Arc<dyn DataStore>,
    relation: String,
    batch_size: usize,
    mut rx: mpsc::Receiver<SinkItem>,
) -> Result<SinkReport, ExtractionError> {
    let mut buffer: Vec<Record> = Vec::with_capacity(batch_size.min(1024));
    let mut report = SinkReport::default();

    while let Some((lines, ack)) = rx.recv().await {
        for line in lines {
            let record = match serde_json::from_str::<Record>(&line) {
                Ok(record) => record,
                Err(source) => return Err(ExtractionError::ParseError { line, source }),
            };
            buffer.push(record);
            if buffer.len() >= batch_size {
                flush(&*store, &relation, &mut buffer, &mut report).await?;
            }
        }
        // releases the producing worker's reader
        let _ = ack.send(());
    }

    if !buffer.is_empty() {
        flush(&*store, &relation, &mut buffer, &mut report).await?;
    }

    debug!(
        relation = %relation,
        records = report.records,
        appends = report.appends,
        "Sink drained"
    );
    Ok(report)
}

async fn flush(
    store: &dyn DataStore,
    relation: &str,
    buffer: &mut Vec<Record>,
    report: &mut SinkReport,
) -> Result<(), ExtractionError> {
    store
        .append_records(relation, buffer)
        .await
        .map_err(|source| ExtractionError::StoreWriteError {
            relation: relation.to_string(),
            source,
        })?;
    report.records += buffer.len() as u64;
    report.appends += 1;
    buffer.clear();
    Ok(())
}
