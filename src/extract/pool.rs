//! Worker pool membership and round-robin dispatch.
//!
//! `spawn` starts all workers for one task and returns two halves with
//! disjoint jobs: the [`WorkerPool`] tracks live membership for the task
//! coordinator (remove on exit, kill on abort), while the [`Dispatcher`]
//! carries the write routes and the round-robin cursor for the feeder.
//! The two halves live on different tasks and share no state, so neither
//! needs a lock.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ExtractionError;

use super::worker::{self, WorkerCommand, WorkerEvent, WorkerHandle, WorkerId};

/// Live membership of one task's workers. Only ever shrinks.
#[derive(Debug)]
pub struct WorkerPool {
    members: Vec<WorkerHandle>,
}

/// Round-robin write surface over the spawned workers.
///
/// Routes are fixed at spawn time: a worker that exits mid-feed fails its
/// next dispatch instead of being silently skipped, which surfaces the
/// lost input as a task failure.
#[derive(Debug)]
pub struct Dispatcher {
    routes: Vec<(WorkerId, mpsc::Sender<WorkerCommand>)>,
    cursor: usize,
}

/// Pending acknowledgment for one dispatched block.
#[derive(Debug)]
pub struct WriteReceipt {
    worker: WorkerId,
    ack: oneshot::Receiver<Result<(), String>>,
}

impl WorkerPool {
    /// Starts `parallelism` workers running `command` and returns the
    /// membership and dispatch halves. Worker ids are the spawn ordinals.
    pub fn spawn(
        parallelism: usize,
        command: &str,
        chunk_size: usize,
        events: mpsc::Sender<WorkerEvent>,
    ) -> (WorkerPool, Dispatcher) {
        let members: Vec<WorkerHandle> = (0..parallelism)
            .map(|id| worker::spawn(id, command, chunk_size, events.clone()))
            .collect();
        let routes = members
            .iter()
            .map(|handle| (handle.id(), handle.commands()))
            .collect();

        (WorkerPool { members }, Dispatcher { routes, cursor: 0 })
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drops `worker` from the live sequence. Returns false when the id is
    /// not (or no longer) a member.
    pub fn remove(&mut self, worker: WorkerId) -> bool {
        let before = self.members.len();
        self.members.retain(|handle| handle.id() != worker);
        self.members.len() < before
    }

    /// Best-effort kill of every remaining worker. Their processes are
    /// reaped on drop.
    pub fn kill_all(&self) {
        for handle in &self.members {
            debug!(worker = handle.id(), "Killing worker");
            handle.abort();
        }
    }
}

impl Dispatcher {
    /// Number of dispatch routes (the pool size at spawn).
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Sends `block` to the next worker in round-robin order and returns a
    /// receipt to await its acknowledgment.
    pub async fn dispatch(&mut self, block: String) -> Result<WriteReceipt, ExtractionError> {
        let (worker, route) = &self.routes[self.cursor];
        let worker = *worker;
        self.cursor = (self.cursor + 1) % self.routes.len();

        let (ack_tx, ack_rx) = oneshot::channel();
        route
            .send(WorkerCommand::Write {
                block,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ExtractionError::WriteFailure {
                worker,
                reason: "worker is gone".to_string(),
            })?;

        Ok(WriteReceipt {
            worker,
            ack: ack_rx,
        })
    }

    /// Sends the no-more-input signal to every route. Workers that already
    /// exited are skipped.
    pub async fn broadcast_close(&self) {
        for (worker, route) in &self.routes {
            if route.send(WorkerCommand::CloseInput).await.is_err() {
                debug!(worker, "Worker gone before close-input");
            }
        }
    }
}

impl WriteReceipt {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Resolves once the worker accepted the block, or with the write
    /// failure that lost it.
    pub async fn wait(self) -> Result<(), ExtractionError> {
        match self.ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ExtractionError::WriteFailure {
                worker: self.worker,
                reason,
            }),
            Err(_) => Err(ExtractionError::WriteFailure {
                worker: self.worker,
                reason: "worker died before acknowledging".to_string(),
            }),
        }
    }
}
