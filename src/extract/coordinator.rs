//! Per-task coordinator driving an extraction from launch to report.
//!
//! # Overview
//!
//! A [`TaskCoordinator`] owns one extraction task for its whole lifetime. It
//! validates the task, runs the before-script, executes the task's style, and
//! finishes with the analyze step and the after-script. For the streaming
//! style it supervises the worker pool, the batch feeder, and the result sink
//! from a single event loop; any failure kills the pool and surfaces the
//! first error, leaving buffered output unflushed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store: Arc<dyn DataStore> = Arc::new(PostgresStore::connect(&url).await?);
//! let task = ExtractionTask::new("ext_people", "udf/ext_people.py")
//!     .with_input_query("SELECT sentence_id, words FROM sentences")
//!     .with_output_relation("people_mentions")
//!     .with_parallelism(4);
//!
//! let report = TaskCoordinator::new(store, CoordinatorConfig::default())
//!     .run(&task)
//!     .await?;
//! println!("extracted {} records", report.records_out);
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::ExtractionError;
use crate::store::{DataStore, Record};
use crate::task::{ExtractionStyle, ExtractionTask, InputSource};

use super::feeder::{BatchFeeder, FeedReport};
use super::pool::WorkerPool;
use super::sink::{self, SinkReport};
use super::worker::WorkerEvent;
use super::{input, scripts};

/// Lifecycle of a coordinated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No task has started yet.
    Idle,
    /// Before-script and setup are in progress. Synchronous styles execute
    /// here without entering Running.
    Launching,
    /// Streaming workers are processing input.
    Running,
    /// Input is exhausted; results are flushing and finish steps run.
    Finishing,
    /// The task completed successfully.
    Terminated,
    /// The task failed and was torn down.
    Failed,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "idle"),
            CoordinatorState::Launching => write!(f, "launching"),
            CoordinatorState::Running => write!(f, "running"),
            CoordinatorState::Finishing => write!(f, "finishing"),
            CoordinatorState::Terminated => write!(f, "terminated"),
            CoordinatorState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one completed extraction task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Unique id for this run.
    pub run_id: Uuid,
    /// Task name from the plan.
    pub task: String,
    /// Style the task ran with.
    pub style: ExtractionStyle,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Records read from the input source.
    pub records_in: u64,
    /// Records written to the output relation.
    pub records_out: u64,
    /// Bulk appends issued against the store.
    pub appends: u64,
    /// Input waves dispatched to the pool.
    pub waves: u64,
}

/// Counters collected by a style runner.
#[derive(Debug, Default, Clone, Copy)]
struct TaskCounts {
    records_in: u64,
    records_out: u64,
    appends: u64,
    waves: u64,
}

/// Supervises a single extraction task.
///
/// A coordinator is consumed by [`run`](TaskCoordinator::run); create a fresh
/// one per task.
pub struct TaskCoordinator {
    store: Arc<dyn DataStore>,
    config: CoordinatorConfig,
    state: CoordinatorState,
}

impl TaskCoordinator {
    /// Creates an idle coordinator bound to a store.
    pub fn new(store: Arc<dyn DataStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            state: CoordinatorState::Idle,
        }
    }

    /// Returns the coordinator's current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Runs the task to completion and returns its report.
    ///
    /// Fails fast: the first error from any script, worker, the feeder, or
    /// the sink tears the task down and is returned as-is. Output buffered
    /// but not yet appended at that point is dropped.
    pub async fn run(mut self, task: &ExtractionTask) -> Result<TaskReport, ExtractionError> {
        task.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        self.state = CoordinatorState::Launching;
        info!(
            run_id = %run_id,
            task = %task.name,
            style = %task.style,
            parallelism = task.parallelism,
            "Starting extraction task"
        );

        let counts = match self.execute(task).await {
            Ok(counts) => counts,
            Err(e) => {
                self.state = CoordinatorState::Failed;
                error!(task = %task.name, error = %e, "Extraction task failed");
                return Err(e);
            }
        };

        self.state = CoordinatorState::Terminated;
        let finished_at = Utc::now();
        let report = TaskReport {
            run_id,
            task: task.name.clone(),
            style: task.style,
            started_at,
            finished_at,
            duration_ms: started.elapsed().as_millis() as u64,
            records_in: counts.records_in,
            records_out: counts.records_out,
            appends: counts.appends,
            waves: counts.waves,
        };

        info!(
            task = %task.name,
            records_in = report.records_in,
            records_out = report.records_out,
            appends = report.appends,
            duration_ms = report.duration_ms,
            "Extraction task complete"
        );

        Ok(report)
    }

    /// Before-script, style execution, analyze step, after-script.
    async fn execute(&mut self, task: &ExtractionTask) -> Result<TaskCounts, ExtractionError> {
        if let Some(script) = &task.before_script {
            scripts::run_script("before", script, self.config.script_timeout).await?;
        }

        let counts = match task.style {
            ExtractionStyle::Streaming => self.run_streaming(task).await?,
            ExtractionStyle::LineOriented => self.run_line_oriented(task).await?,
            ExtractionStyle::DirectQuery => self.run_direct_query(task).await?,
            ExtractionStyle::ShellCommand => self.run_shell_command(task).await?,
            ExtractionStyle::CompiledFunction => self.run_compiled_function(task).await?,
        };

        self.state = CoordinatorState::Finishing;

        if task.writes_output() {
            if let Some(relation) = &task.output_relation {
                debug!(task = %task.name, relation = %relation, "Analyzing output relation");
                self.store.analyze(relation).await.map_err(|e| {
                    ExtractionError::StoreWriteError {
                        relation: relation.clone(),
                        source: e,
                    }
                })?;
            }
        }

        if let Some(script) = &task.after_script {
            scripts::run_script("after", script, self.config.script_timeout).await?;
        }

        Ok(counts)
    }

    /// Streams input records through a pool of UDF processes.
    ///
    /// One event at a time: worker output is forwarded to the sink, worker
    /// exits shrink the pool, and feeder or sink failures abort everything.
    /// The loop ends when the last worker has exited cleanly.
    async fn run_streaming(
        &mut self,
        task: &ExtractionTask,
    ) -> Result<TaskCounts, ExtractionError> {
        if !self.store.supports_streaming() {
            return Err(ExtractionError::UnsupportedStyleOnDriver {
                style: task.style.to_string(),
                driver: self.store.driver_name().to_string(),
            });
        }

        let source = task.input.as_ref().ok_or_else(|| missing(task, "input"))?;
        let relation = task
            .output_relation
            .clone()
            .ok_or_else(|| missing(task, "output_relation"))?;

        let input = input::open(self.store.as_ref(), source, task.input_batch_size).await?;

        let (events_tx, mut events_rx) = mpsc::channel(task.parallelism * 2);
        let (mut pool, dispatcher) =
            WorkerPool::spawn(task.parallelism, &task.udf, task.output_batch_size, events_tx);

        let sink::SinkHandle {
            tx: sink_tx,
            task: mut sink_task,
        } = sink::spawn(Arc::clone(&self.store), relation, task.output_batch_size);

        let feeder = BatchFeeder::new(dispatcher, task.input_batch_size)
            .with_ack_timeout(self.config.ack_timeout);
        let mut feeder_task = tokio::spawn(feeder.feed(input));

        self.state = CoordinatorState::Running;
        info!(task = %task.name, workers = pool.len(), "Worker pool started");

        let mut status = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.status_interval,
            self.config.status_interval,
        );

        let mut feed_report = FeedReport::default();
        let mut feeder_done = false;
        let mut sink_result: Option<SinkReport> = None;
        let mut sink_done = false;

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(WorkerEvent::Output { worker, lines, ack }) => {
                        debug!(worker, lines = lines.len(), "Forwarding worker output");
                        if sink_tx.send((lines, ack)).await.is_err() {
                            // The sink stopped; its own error is the real cause.
                            sink_done = true;
                            let error = match flatten_join((&mut sink_task).await) {
                                Ok(_) => ExtractionError::WriteFailure {
                                    worker,
                                    reason: "result sink stopped early".to_string(),
                                },
                                Err(e) => e,
                            };
                            shut_down(&pool, &feeder_task, &sink_task);
                            return Err(error);
                        }
                    }
                    Some(WorkerEvent::Exited { worker, code }) => {
                        if code != 0 {
                            shut_down(&pool, &feeder_task, &sink_task);
                            return Err(ExtractionError::WorkerCrash { worker, code });
                        }
                        pool.remove(worker);
                        info!(worker, remaining = pool.len(), "Worker finished");
                        if pool.is_empty() {
                            break;
                        }
                    }
                    None => {
                        // Every worker task has ended and their exits were
                        // handled; nothing more can arrive.
                        break;
                    }
                },
                res = &mut feeder_task, if !feeder_done => {
                    feeder_done = true;
                    match flatten_join(res) {
                        Ok(report) => {
                            feed_report = report;
                            debug!(
                                records = report.records,
                                waves = report.waves,
                                "Feeder finished"
                            );
                        }
                        Err(e) => {
                            shut_down(&pool, &feeder_task, &sink_task);
                            return Err(e);
                        }
                    }
                },
                res = &mut sink_task, if !sink_done => {
                    sink_done = true;
                    match flatten_join(res) {
                        Ok(report) => sink_result = Some(report),
                        Err(e) => {
                            shut_down(&pool, &feeder_task, &sink_task);
                            return Err(e);
                        }
                    }
                },
                _ = status.tick() => {
                    info!(
                        task = %task.name,
                        workers = pool.len(),
                        state = %self.state,
                        "Extraction in progress"
                    );
                }
            }
        }

        self.state = CoordinatorState::Finishing;

        // Workers that exited early without draining their input leave the
        // feeder facing a dead channel; its error carries the cause.
        if !feeder_done {
            match flatten_join((&mut feeder_task).await) {
                Ok(report) => feed_report = report,
                Err(e) => {
                    sink_task.abort();
                    return Err(e);
                }
            }
        }

        // Closing the channel lets the sink flush its trailing partial batch.
        drop(sink_tx);
        let sink_report = match sink_result {
            Some(report) => report,
            None => match flatten_join((&mut sink_task).await) {
                Ok(report) => report,
                Err(e) => {
                    pool.kill_all();
                    return Err(e);
                }
            },
        };

        Ok(TaskCounts {
            records_in: feed_report.records,
            records_out: sink_report.records,
            appends: sink_report.appends,
            waves: feed_report.waves,
        })
    }

    /// Materializes the input to a delimited temp file, runs the UDF once
    /// over it, and appends its parsed stdout to the output relation.
    async fn run_line_oriented(
        &mut self,
        task: &ExtractionTask,
    ) -> Result<TaskCounts, ExtractionError> {
        let source = task.input.as_ref().ok_or_else(|| missing(task, "input"))?;
        let relation = task
            .output_relation
            .clone()
            .ok_or_else(|| missing(task, "output_relation"))?;
        let separator = match source {
            InputSource::File { separator, .. } => *separator,
            InputSource::Query { .. } => '\t',
        };

        let mut input = input::open(self.store.as_ref(), source, task.input_batch_size).await?;
        let staged = tempfile::NamedTempFile::new()?;
        let file = tokio::fs::File::create(staged.path()).await?;
        let mut writer = tokio::io::BufWriter::new(file);

        let mut records_in = 0u64;
        while let Some(record) = input.next().await {
            let record = record.map_err(ExtractionError::InputError)?;
            writer
                .write_all(input::record_to_line(&record, separator).as_bytes())
                .await?;
            writer.write_all(b"\n").await?;
            records_in += 1;
        }
        writer.flush().await?;

        info!(task = %task.name, records = records_in, "Input staged, running command");

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&task.udf)
            .stdin(std::process::Stdio::from(staged.reopen()?))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let drain = self.drain_command_output(task, command, &relation, separator);
        let counts = match self.config.script_timeout {
            Some(limit) => match tokio::time::timeout(limit, drain).await {
                Ok(res) => res?,
                Err(_) => {
                    error!(task = %task.name, timeout_secs = limit.as_secs(), "Command timed out");
                    return Err(ExtractionError::ScriptFailure {
                        script: task.udf.clone(),
                        code: -1,
                    });
                }
            },
            None => drain.await?,
        };

        info!(
            task = %task.name,
            records_out = counts.records_out,
            appends = counts.appends,
            "Command output appended"
        );

        Ok(TaskCounts {
            records_in,
            ..counts
        })
    }

    /// Spawns the staged command and streams its stdout into the output
    /// relation without buffering it whole. Full batches are appended as they
    /// fill; the trailing partial batch is appended only after a clean exit.
    async fn drain_command_output(
        &self,
        task: &ExtractionTask,
        mut command: tokio::process::Command,
        relation: &str,
        separator: char,
    ) -> Result<TaskCounts, ExtractionError> {
        let mut child = command.spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let name = task.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        info!(task = %name, stderr = %trimmed, "UDF stderr");
                    }
                }
            });
        }

        let mut counts = TaskCounts::default();
        let mut buffer: Vec<Record> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                buffer.push(input::line_to_record(&line, separator));
                if buffer.len() >= task.output_batch_size {
                    append_lines(self.store.as_ref(), relation, &mut buffer, &mut counts)
                        .await?;
                }
            }
        }

        let code = child.wait().await?.code().unwrap_or(-1);
        if code != 0 {
            return Err(ExtractionError::ScriptFailure {
                script: task.udf.clone(),
                code,
            });
        }

        if !buffer.is_empty() {
            append_lines(self.store.as_ref(), relation, &mut buffer, &mut counts).await?;
        }
        Ok(counts)
    }

    /// Executes the UDF field as a SQL statement on the store.
    async fn run_direct_query(
        &mut self,
        task: &ExtractionTask,
    ) -> Result<TaskCounts, ExtractionError> {
        info!(task = %task.name, "Executing statement");

        let affected = self
            .store
            .execute(&task.udf)
            .await
            .map_err(ExtractionError::StatementFailure)?;

        info!(task = %task.name, rows = affected, "Statement complete");
        Ok(TaskCounts {
            records_out: affected,
            ..Default::default()
        })
    }

    /// Runs the UDF field as a shell command with no managed input.
    async fn run_shell_command(
        &mut self,
        task: &ExtractionTask,
    ) -> Result<TaskCounts, ExtractionError> {
        scripts::run_script(&task.name, &task.udf, self.config.script_timeout).await?;
        Ok(TaskCounts::default())
    }

    /// Installs the UDF as an in-database function, then populates the
    /// output relation by running the task's input query through it.
    async fn run_compiled_function(
        &mut self,
        task: &ExtractionTask,
    ) -> Result<TaskCounts, ExtractionError> {
        let query = match &task.input {
            Some(InputSource::Query { query }) => query.clone(),
            _ => return Err(missing(task, "input query")),
        };
        let relation = task
            .output_relation
            .as_ref()
            .ok_or_else(|| missing(task, "output_relation"))?;

        info!(task = %task.name, "Installing function");
        self.store
            .execute(&task.udf)
            .await
            .map_err(ExtractionError::StatementFailure)?;

        let insert = format!("INSERT INTO {} {}", relation, query);
        let affected = self
            .store
            .execute(&insert)
            .await
            .map_err(ExtractionError::StatementFailure)?;

        info!(task = %task.name, rows = affected, "Function results inserted");
        Ok(TaskCounts {
            records_out: affected,
            ..Default::default()
        })
    }
}

/// Kills the pool and stops the background tasks after a failure.
fn shut_down(
    pool: &WorkerPool,
    feeder: &JoinHandle<Result<FeedReport, ExtractionError>>,
    sink: &JoinHandle<Result<SinkReport, ExtractionError>>,
) {
    pool.kill_all();
    feeder.abort();
    sink.abort();
}

/// Appends the buffered lines as one batch and folds them into the counts.
async fn append_lines(
    store: &dyn DataStore,
    relation: &str,
    buffer: &mut Vec<Record>,
    counts: &mut TaskCounts,
) -> Result<(), ExtractionError> {
    store
        .append_records(relation, buffer)
        .await
        .map_err(|source| ExtractionError::StoreWriteError {
            relation: relation.to_string(),
            source,
        })?;
    counts.records_out += buffer.len() as u64;
    counts.appends += 1;
    buffer.clear();
    Ok(())
}

fn missing(task: &ExtractionTask, field: &str) -> ExtractionError {
    ExtractionError::InvalidTask {
        task: task.name.clone(),
        reason: format!("{} style requires {}", task.style, field),
    }
}

fn flatten_join<T>(
    res: Result<Result<T, ExtractionError>, tokio::task::JoinError>,
) -> Result<T, ExtractionError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(ExtractionError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("background task failed: {}", e),
        ))),
    }
}
