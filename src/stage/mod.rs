//! Stage runners.
//!
//! [`ProducerStage`], [`ConsumerStage`] and [`ProcessorStage`] bind a stage
//! implementation to its queues and run it through the same loop:
//!
//! 1. `before_start` (an error here skips the loop and `finished`)
//! 2. while the task should continue and there is input: run one step,
//!    counting and reporting its error if it fails, then advance progress
//! 3. `finished`
//!
//! Producers and processors then release their registration on the output
//! queue, which closes it if it is set to close automatically and they were
//! its last producer.

mod consumer;
mod processor;
mod producer;

pub use consumer::ConsumerStage;
pub use processor::ProcessorStage;
pub use producer::ProducerStage;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::task::{Task, TaskContext};

/// Counters kept by a running stage. Readable at any time.
///
/// `item_count` is the number of items produced (producers) or consumed
/// successfully (consumers and processors); `duration` is the cumulative
/// time spent inside the producing/consuming step.
#[derive(Debug, Default)]
pub struct StageStats {
    items: AtomicU64,
    duration_nanos: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`StageStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageSnapshot {
    pub items: u64,
    pub duration: Duration,
    pub errors: u64,
}

impl StageStats {
    pub fn item_count(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos.load(Ordering::Relaxed))
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            items: self.item_count(),
            duration: self.duration(),
            errors: self.error_count(),
        }
    }

    pub(crate) fn record_item(&self) {
        self.items.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs `future`, adding its wall time to the duration counter.
    pub(crate) async fn timed<F: Future>(&self, future: F) -> F::Output {
        let started = Instant::now();
        let output = future.await;
        let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.duration_nanos.fetch_add(elapsed, Ordering::Relaxed);
        output
    }
}

/// Whether the stage loop goes on after a step.
pub(crate) enum Flow {
    Continue,
    Done,
}

/// What a stage plugs into [`drive`].
#[async_trait]
pub(crate) trait StageDriver: Send {
    type Input: Send;

    async fn before_start(&mut self) -> Result<()>;

    /// Next unit of work, or `None` to end the loop.
    async fn next_input(&mut self, ctx: &TaskContext) -> Option<Self::Input>;

    async fn step(&mut self, input: Self::Input, ctx: &TaskContext) -> Result<Flow>;

    fn handle_error(&mut self, error: Error);

    async fn finished(&mut self);
}

pub(crate) async fn drive<D: StageDriver>(
    driver: &mut D,
    stats: &StageStats,
    ctx: &TaskContext,
) -> Result<()> {
    driver.before_start().await?;

    while ctx.should_continue().await {
        let Some(input) = driver.next_input(ctx).await else {
            break;
        };

        match driver.step(input, ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done) => break,
            Err(error) => {
                stats.record_error();
                #[cfg(feature = "metrics")]
                metrics::counter!("asyncpipe_stage_errors_total", "task" => ctx.name().to_string())
                    .increment(1);
                driver.handle_error(error);
            }
        }
        ctx.add_progress(1);
    }

    driver.finished().await;
    Ok(())
}

/// A stage running as a background [`Task`].
#[derive(Debug)]
pub struct StageHandle {
    task: Task,
    stats: Arc<StageStats>,
}

impl StageHandle {
    pub(crate) fn new(task: Task, stats: Arc<StageStats>) -> Self {
        Self { task, stats }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    /// Loop iterations completed so far, including failed ones
    pub fn progress(&self) -> u64 {
        self.task.progress_index()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn pause(&self) {
        self.task.pause();
    }

    pub fn resume(&self) {
        self.task.resume();
    }

    pub async fn join(&self) -> Result<()> {
        self.task.join().await
    }
}
