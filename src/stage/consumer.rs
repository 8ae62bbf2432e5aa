use std::sync::Arc;

use async_trait::async_trait;

use super::{drive, Flow, StageDriver, StageHandle, StageStats};
use crate::error::{Error, Result};
use crate::queue::AsyncQueue;
use crate::task::{Task, TaskContext, TaskExecutor};
use crate::traits::Consumer;

/// Runs a [`Consumer`] over every item of an input queue.
///
/// The loop ends when the input queue is closed and drained, or when the
/// task is stopped. Failing items are counted and handed to
/// [`Consumer::handle_error`]; they never end the loop.
pub struct ConsumerStage<C: Consumer> {
    consumer: C,
    input: Arc<AsyncQueue<C::Item>>,
    stats: Arc<StageStats>,
}

impl<C: Consumer> ConsumerStage<C> {
    pub fn new(consumer: C, input: Arc<AsyncQueue<C::Item>>) -> Self {
        Self {
            consumer,
            input,
            stats: Arc::new(StageStats::default()),
        }
    }

    pub fn input(&self) -> &Arc<AsyncQueue<C::Item>> {
        &self.input
    }

    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    /// Run the stage to completion on the current task.
    pub async fn run(mut self, ctx: &TaskContext) -> Result<()> {
        let stats = Arc::clone(&self.stats);
        drive(&mut self, &stats, ctx).await
    }
}

impl<C> ConsumerStage<C>
where
    C: Consumer + 'static,
{
    /// Run the stage as a background task named after the consumer type
    pub fn spawn(self, executor: &TaskExecutor) -> StageHandle {
        self.spawn_named(std::any::type_name::<C>(), executor)
    }

    pub fn spawn_named(self, name: &str, executor: &TaskExecutor) -> StageHandle {
        let stats = self.stats();
        let task = Task::spawn(name, executor, move |ctx| async move { self.run(&ctx).await });
        StageHandle::new(task, stats)
    }
}

#[async_trait]
impl<C: Consumer> StageDriver for ConsumerStage<C> {
    type Input = C::Item;

    async fn before_start(&mut self) -> Result<()> {
        self.consumer.before_start().await
    }

    async fn next_input(&mut self, ctx: &TaskContext) -> Option<C::Item> {
        self.input.remove_cancellable(ctx.cancellation_token()).await
    }

    async fn step(&mut self, item: C::Item, _ctx: &TaskContext) -> Result<Flow> {
        self.stats.timed(self.consumer.consume(item)).await?;
        self.stats.record_item();
        Ok(Flow::Continue)
    }

    fn handle_error(&mut self, error: Error) {
        self.consumer.handle_error(error);
    }

    async fn finished(&mut self) {
        self.consumer.finished().await;
    }
}
