//! Wave-based input feeding.
//!
//! The feeder pulls records from a lazy input stream and pushes them to the
//! worker pool in waves of `parallelism × input_batch_size` records. Each
//! wave is cut into at most `parallelism` chunks of at most
//! `input_batch_size` records, dispatched round-robin, and the feeder waits
//! for every acknowledgment in the wave before pulling the next one. That
//! barrier caps dispatched-but-unacknowledged records at one wave.
//!
//! The feeder runs on its own task: its per-wave waits block nobody else.

use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info};

use crate::error::ExtractionError;
use crate::store::{Record, RecordStream};

use super::pool::Dispatcher;

/// Counters reported by a completed feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Records pulled from the input and dispatched.
    pub records: u64,
    /// Waves dispatched.
    pub waves: u64,
    /// Chunks dispatched across all waves.
    pub chunks: u64,
}

/// Streams one task's input through the dispatcher.
#[derive(Debug)]
pub struct BatchFeeder {
    dispatcher: Dispatcher,
    batch_size: usize,
    ack_timeout: Option<Duration>,
}

impl BatchFeeder {
    /// Creates a feeder over `dispatcher` cutting chunks of `batch_size`
    /// records.
    pub fn new(dispatcher: Dispatcher, batch_size: usize) -> Self {
        Self {
            dispatcher,
            batch_size,
            ack_timeout: None,
        }
    }

    /// Bounds how long one wave may stay unacknowledged. `None` (the
    /// default) waits indefinitely.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Feeds the whole input, then broadcasts close-input to all workers.
    ///
    /// Consumes the feeder: an input is fed exactly once. Any dispatch,
    /// acknowledgment, or input failure aborts immediately; remaining
    /// records are not pulled.
    pub async fn feed(mut self, input: RecordStream) -> Result<FeedReport, ExtractionError> {
        let wave_size = self.dispatcher.len() * self.batch_size;
        let mut input = input.fuse();
        let mut report = FeedReport::default();

        loop {
            let mut wave: Vec<Record> = Vec::with_capacity(wave_size.min(8192));
            while wave.len() < wave_size {
                match input.next().await {
                    Some(Ok(record)) => wave.push(record),
                    Some(Err(e)) => return Err(ExtractionError::InputError(e)),
                    None => break,
                }
            }
            if wave.is_empty() {
                break;
            }

            report.records += wave.len() as u64;
            report.waves += 1;
            report.chunks += self.dispatch_wave(wave).await? as u64;
        }

        self.dispatcher.broadcast_close().await;
        info!(
            records = report.records,
            waves = report.waves,
            chunks = report.chunks,
            "Input fully dispatched"
        );
        Ok(report)
    }

    /// Dispatches one wave and waits for all of its acknowledgments.
    async fn dispatch_wave(&mut self, wave: Vec<Record>) -> Result<usize, ExtractionError> {
        let mut receipts = Vec::with_capacity(self.dispatcher.len());
        for chunk in wave.chunks(self.batch_size) {
            let receipt = self.dispatcher.dispatch(encode_block(chunk)).await?;
            receipts.push(receipt);
        }

        let dispatched = receipts.len();
        for receipt in receipts {
            match self.ack_timeout {
                None => receipt.wait().await?,
                Some(limit) => match tokio::time::timeout(limit, receipt.wait()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ExtractionError::AckTimeout {
                            seconds: limit.as_secs(),
                        })
                    }
                },
            }
        }

        debug!(chunks = dispatched, "Wave acknowledged");
        Ok(dispatched)
    }
}

/// Renders records as newline-terminated JSON lines for a worker's stdin.
fn encode_block(records: &[Record]) -> String {
    let mut block = String::new();
    for record in records {
        block.push_str(&record.to_string());
        block.push('\n');
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::extract::pool::WorkerPool;
    use crate::extract::worker::{WorkerEvent, WorkerId};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot};

    /// Spawns a pool of `cat` workers and feeds `records` through it.
    /// Returns the feed result, each worker's echoed lines, and exit codes.
    async fn feed_through_cats(
        parallelism: usize,
        batch_size: usize,
        records: Vec<Record>,
    ) -> (
        Result<FeedReport, ExtractionError>,
        HashMap<WorkerId, Vec<String>>,
        Vec<i32>,
    ) {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_pool, dispatcher) = WorkerPool::spawn(parallelism, "cat", 1000, events_tx);

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut outputs: HashMap<WorkerId, Vec<String>> = HashMap::new();
            let mut exits = Vec::new();
            while let Some(event) = events_rx.recv().await {
                match event {
                    WorkerEvent::Output { worker, lines, ack } => {
                        outputs.entry(worker).or_default().extend(lines);
                        let _ = ack.send(());
                    }
                    WorkerEvent::Exited { code, .. } => exits.push(code),
                }
            }
            let _ = done_tx.send((outputs, exits));
        });

        let input = futures::stream::iter(records.into_iter().map(Ok)).boxed();
        let result = BatchFeeder::new(dispatcher, batch_size).feed(input).await;

        let (outputs, exits) = done_rx.await.expect("event drain died");
        (result, outputs, exits)
    }

    fn numbers(n: usize) -> Vec<Record> {
        (0..n).map(|i| json!(i)).collect()
    }

    fn rendered(ids: &[usize]) -> Vec<String> {
        ids.iter().map(|i| i.to_string()).collect()
    }

    #[tokio::test]
    async fn test_waves_dispatch_contiguous_chunks_round_robin() {
        let (result, outputs, exits) = feed_through_cats(2, 3, numbers(14)).await;

        let report = result.unwrap();
        assert_eq!(
            report,
            FeedReport {
                records: 14,
                waves: 3,
                chunks: 5
            }
        );

        // waves: [0..6) -> chunks 0,1 | [6..12) -> chunks 2,3 | [12..14) -> chunk 4
        assert_eq!(outputs[&0], rendered(&[0, 1, 2, 6, 7, 8, 12, 13]));
        assert_eq!(outputs[&1], rendered(&[3, 4, 5, 9, 10, 11]));
        assert_eq!(exits, vec![0, 0]);
    }

    #[tokio::test]
    async fn test_short_input_uses_part_of_the_pool() {
        let (result, outputs, exits) = feed_through_cats(4, 10, numbers(3)).await;

        let report = result.unwrap();
        assert_eq!(
            report,
            FeedReport {
                records: 3,
                waves: 1,
                chunks: 1
            }
        );
        assert_eq!(outputs[&0], rendered(&[0, 1, 2]));
        assert!(!outputs.contains_key(&1));
        assert_eq!(exits.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_input_closes_workers_without_waves() {
        let (result, outputs, exits) = feed_through_cats(2, 5, Vec::new()).await;

        assert_eq!(result.unwrap(), FeedReport::default());
        assert!(outputs.is_empty());
        assert_eq!(exits, vec![0, 0]);
    }

    #[tokio::test]
    async fn test_input_error_aborts_the_feed() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (pool, dispatcher) = WorkerPool::spawn(2, "cat", 1000, events_tx);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let WorkerEvent::Output { ack, .. } = event {
                    let _ = ack.send(());
                }
            }
        });

        let input = futures::stream::iter(vec![
            Ok(json!(1)),
            Err(StoreError::QueryFailed("connection reset".to_string())),
        ])
        .boxed();

        let err = BatchFeeder::new(dispatcher, 10).feed(input).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InputError(_)));
        pool.kill_all();
    }

    #[tokio::test]
    async fn test_overdue_ack_times_out() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        // the worker never reads stdin, so a block larger than the pipe
        // buffer cannot be accepted and the ack never arrives
        let (pool, dispatcher) = WorkerPool::spawn(1, "sleep 5", 1000, events_tx);

        let big = json!("x".repeat(256 * 1024));
        let input = futures::stream::iter(vec![Ok(big)]).boxed();

        let err = BatchFeeder::new(dispatcher, 1)
            .with_ack_timeout(Some(Duration::from_millis(200)))
            .feed(input)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::AckTimeout { .. }));
        pool.kill_all();
    }

    #[tokio::test]
    async fn test_unacknowledged_wave_blocks_further_pulls() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        // never-reading workers: the first wave's blocks overflow the pipe
        // buffer, so its acks never arrive and the feeder must stall
        let (pool, dispatcher) = WorkerPool::spawn(2, "sleep 5", 1000, events_tx);

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let records: Vec<Record> = (0..12).map(|_| json!("x".repeat(256 * 1024))).collect();
        let input = futures::stream::iter(records.into_iter().map(Ok))
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed();

        let feed = tokio::spawn(BatchFeeder::new(dispatcher, 2).feed(input));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // exactly one wave of parallelism x batch_size records was pulled
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
        assert!(!feed.is_finished());

        feed.abort();
        pool.kill_all();
    }
}
