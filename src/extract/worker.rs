//! One external UDF worker process.
//!
//! A worker wraps a single OS process started through the platform shell.
//! Input blocks are written to its stdin by a dedicated writer task; stdout
//! is read line-by-line and delivered upward in chunks; stderr is drained
//! and logged. The supervisor receives exactly one `Exited` event per
//! worker, emitted only after every output chunk has been delivered and
//! acknowledged.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Identifies a worker within one task's pool.
pub type WorkerId = usize;

/// Exit code reported when the UDF process could not be started at all.
/// Matches the shell's command-not-found convention.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Commands accepted by a worker's stdin writer.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Write a newline-terminated block of input lines to the process.
    /// The acknowledgment resolves once the bytes are accepted by the OS,
    /// or carries the write error.
    Write {
        block: String,
        ack: oneshot::Sender<Result<(), String>>,
    },
    /// Half-close the process stdin; the UDF is expected to flush its
    /// remaining output and exit.
    CloseInput,
}

/// Events a worker reports to its supervisor.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A chunk of stdout lines. The worker reads no further output until
    /// the acknowledgment is sent.
    Output {
        worker: WorkerId,
        lines: Vec<String>,
        ack: oneshot::Sender<()>,
    },
    /// Terminal event: the process exited with `code`. Workers killed by a
    /// signal report -1; workers that never started report 127.
    Exited { worker: WorkerId, code: i32 },
}

/// Handle to a spawned worker, held by the pool.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    commands: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns a sender for this worker's command channel.
    pub(crate) fn commands(&self) -> mpsc::Sender<WorkerCommand> {
        self.commands.clone()
    }

    /// Aborts the worker task. The child process is killed on drop.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Starts one worker process and its supervision task.
///
/// The process is launched as `sh -c <command>`; a command that cannot be
/// resolved surfaces as an `Exited` event with code 127 rather than a spawn
/// error, so every worker failure takes the same path.
pub fn spawn(
    id: WorkerId,
    command: &str,
    chunk_size: usize,
    events: mpsc::Sender<WorkerEvent>,
) -> WorkerHandle {
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let command = command.to_string();

    let task = tokio::spawn(async move {
        let code = run_process(id, &command, chunk_size, &events, commands_rx).await;
        // Exit is reported only after the output loop above has drained
        // and every chunk was acknowledged.
        let _ = events
            .send(WorkerEvent::Exited { worker: id, code })
            .await;
    });

    WorkerHandle {
        id,
        commands: commands_tx,
        task,
    }
}

async fn run_process(
    id: WorkerId,
    command: &str,
    chunk_size: usize,
    events: &mpsc::Sender<WorkerEvent>,
    commands: mpsc::Receiver<WorkerCommand>,
) -> i32 {
    debug!(worker = id, command = %command, "Starting UDF process");

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!(worker = id, error = %e, "Failed to spawn UDF process");
            return SPAWN_FAILURE_CODE;
        }
    };

    let writer = tokio::spawn(write_loop(child.stdin.take(), commands));

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    info!(worker = id, stderr = %trimmed, "UDF stderr");
                }
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        read_output(id, stdout, chunk_size, events).await;
    }

    let code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!(worker = id, error = %e, "Failed to wait on UDF process");
            -1
        }
    };

    writer.abort();
    debug!(worker = id, code, "UDF process exited");
    code
}

/// Consumes write commands until every sender is gone. Dropping the command
/// channel without a `CloseInput` closes stdin as well, so an aborted feed
/// still lets workers run to EOF.
async fn write_loop(stdin: Option<ChildStdin>, mut commands: mpsc::Receiver<WorkerCommand>) {
    let mut stdin = stdin;
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Write { block, ack } => {
                let result = match stdin.as_mut() {
                    Some(pipe) => write_block(pipe, &block).await,
                    None => Err("worker stdin is closed".to_string()),
                };
                let _ = ack.send(result);
            }
            WorkerCommand::CloseInput => {
                // dropping the pipe delivers EOF
                stdin = None;
            }
        }
    }
}

async fn write_block(stdin: &mut ChildStdin, block: &str) -> Result<(), String> {
    stdin
        .write_all(block.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    stdin.flush().await.map_err(|e| e.to_string())
}

/// Reads stdout to EOF, delivering chunks of `chunk_size` lines plus a
/// trailing partial chunk. Each chunk must be acknowledged before the next
/// read, which bounds how far a worker can run ahead of the sink.
async fn read_output(
    id: WorkerId,
    stdout: ChildStdout,
    chunk_size: usize,
    events: &mpsc::Sender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut chunk: Vec<String> = Vec::with_capacity(chunk_size.min(1024));

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                chunk.push(line);
                if chunk.len() >= chunk_size && !deliver(id, &mut chunk, events).await {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(worker = id, error = %e, "Error reading UDF stdout");
                break;
            }
        }
    }

    if !chunk.is_empty() {
        deliver(id, &mut chunk, events).await;
    }
}

/// Sends one chunk upward and waits for its acknowledgment. Returns false
/// when the supervisor is gone and reading should stop.
async fn deliver(
    id: WorkerId,
    chunk: &mut Vec<String>,
    events: &mpsc::Sender<WorkerEvent>,
) -> bool {
    let lines = std::mem::take(chunk);
    let (ack_tx, ack_rx) = oneshot::channel();
    if events
        .send(WorkerEvent::Output {
            worker: id,
            lines,
            ack: ack_tx,
        })
        .await
        .is_err()
    {
        return false;
    }
    ack_rx.await.is_ok()
}
