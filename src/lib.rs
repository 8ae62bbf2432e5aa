//! # Bounded async queues and the stages that run around them
//!
//! This crate connects producers, processors and consumers through bounded,
//! closeable queues. Each stage runs its loop inside a managed background
//! task with cooperative stop and pause.
//!
//! ## Core Concepts
//!
//! - **AsyncQueue**: Bounded FIFO with blocking add/remove, explicit close,
//!   and automatic close once its last registered producer leaves
//! - **Producer**: Generates items into an output queue
//! - **Consumer**: Drains an input queue until it is closed and empty
//! - **Processor**: Consumes from one queue and produces into another
//! - **Task**: The background task a stage runs in
//! - **Pipeline**: A group of running stages
//!
//! ## Example
//!
//! ```rust
//! use asyncpipe::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let executor = TaskExecutor::default();
//!
//!     let numbers = ProducerStage::new(from_iter(1..=5));
//!     let doubled = ProcessorStage::new(MapProcessor::new(|x: i32| x * 2), Arc::clone(numbers.output()));
//!
//!     let collector = CollectConsumer::new();
//!     let items = collector.items();
//!     let sink = ConsumerStage::new(collector, Arc::clone(doubled.output()));
//!
//!     let pipeline = Pipeline::new()
//!         .with(numbers.spawn(&executor))
//!         .with(doubled.spawn(&executor))
//!         .with(sink.spawn(&executor));
//!     pipeline.join().await?;
//!
//!     assert_eq!(*items.lock().await, vec![2, 4, 6, 8, 10]);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod impls;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod task;
pub mod traits;
pub mod util;

// Re-export commonly used items
pub mod prelude {
    pub use crate::error::{Error, IntoError, Result};
    pub use crate::impls::{consumers::*, processors::*, producers::*};
    pub use crate::pipeline::{Pipeline, StageReport};
    pub use crate::queue::{AsyncQueue, QueueConfig};
    pub use crate::stage::{ConsumerStage, ProcessorStage, ProducerStage, StageHandle};
    pub use crate::task::{Task, TaskContext, TaskExecutor};
    pub use crate::traits::{Consumer, Processor, Producer};
    pub use crate::util::{consumer_from_fn, processor_from_fn, producer_from_fn};
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
