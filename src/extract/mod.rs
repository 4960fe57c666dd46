//! Streaming extraction engine.
//!
//! This module runs extraction tasks: external UDF processes that transform
//! input records into output records, one JSON value per line on stdin and
//! stdout.
//!
//! # Overview
//!
//! The engine consists of:
//! - **Coordinator**: per-task supervisor and event loop
//! - **Pool / Dispatcher**: worker process lifecycle and round-robin routing
//! - **Worker**: one UDF process with its writer, reader, and stderr tasks
//! - **Feeder**: wave-based input dispatch with acknowledgment backpressure
//! - **Sink**: batched result collection into the output relation
//! - **Input**: record streams from store queries or delimited files
//! - **Scripts**: before/after shell hooks
//!
//! # Usage
//!
//! ```rust,ignore
//! use factmill::extract::TaskCoordinator;
//! use factmill::config::CoordinatorConfig;
//! use factmill::task::ExtractionTask;
//!
//! let task = ExtractionTask::new("ext_people", "udf/ext_people.py")
//!     .with_input_query("SELECT sentence_id, words FROM sentences")
//!     .with_output_relation("people_mentions")
//!     .with_parallelism(4);
//!
//! let report = TaskCoordinator::new(store, CoordinatorConfig::default())
//!     .run(&task)
//!     .await?;
//! ```

pub mod coordinator;
pub mod feeder;
pub mod input;
pub mod pool;
pub mod scripts;
pub mod sink;
pub mod worker;

pub use coordinator::{CoordinatorState, TaskCoordinator, TaskReport};
pub use feeder::{BatchFeeder, FeedReport};
pub use pool::{Dispatcher, WorkerPool, WriteReceipt};
pub use sink::{SinkHandle, SinkReport};
pub use worker::{WorkerEvent, WorkerHandle, WorkerId, SPAWN_FAILURE_CODE};
