use std::sync::Arc;

use async_trait::async_trait;

use super::{drive, Flow, StageDriver, StageHandle, StageStats};
use crate::error::{Error, Result};
use crate::queue::{AsyncQueue, ProducerId, ProducerRegistration};
use crate::task::{Task, TaskContext, TaskExecutor};
use crate::traits::Processor;

/// Runs a [`Processor`] between an input queue and an output queue.
///
/// On the input side it behaves like a [`super::ConsumerStage`]: it drains
/// the input until end-of-stream, counting failures without stopping. On
/// the output side it is a registered producer, like a
/// [`super::ProducerStage`]. Once the output is closed every add fails with
/// [`Error::QueueClosed`], which is counted like any other item failure
/// while the input keeps draining.
pub struct ProcessorStage<R: Processor> {
    processor: R,
    input: Arc<AsyncQueue<R::Input>>,
    output: Arc<AsyncQueue<R::Output>>,
    registration: ProducerRegistration<R::Output>,
    stats: Arc<StageStats>,
}

impl<R: Processor> ProcessorStage<R> {
    /// Create a stage with a private output queue. The queue closes once
    /// this stage is done.
    pub fn new(processor: R, input: Arc<AsyncQueue<R::Input>>) -> Self {
        let output = Arc::new(AsyncQueue::new());
        let stage = Self::with_output(processor, input, Arc::clone(&output));
        output.close_automatically();
        stage
    }

    pub fn with_output(
        processor: R,
        input: Arc<AsyncQueue<R::Input>>,
        output: Arc<AsyncQueue<R::Output>>,
    ) -> Self {
        let registration = output.register_producer();
        Self {
            processor,
            input,
            output,
            registration,
            stats: Arc::new(StageStats::default()),
        }
    }

    pub fn input(&self) -> &Arc<AsyncQueue<R::Input>> {
        &self.input
    }

    pub fn output(&self) -> &Arc<AsyncQueue<R::Output>> {
        &self.output
    }

    pub fn producer_id(&self) -> ProducerId {
        self.registration.id()
    }

    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    /// Run the stage to completion on the current task.
    pub async fn run(mut self, ctx: &TaskContext) -> Result<()> {
        let stats = Arc::clone(&self.stats);
        let result = drive(&mut self, &stats, ctx).await;
        // releases the registration on the output queue
        drop(self);
        result
    }
}

impl<R> ProcessorStage<R>
where
    R: Processor + 'static,
{
    /// Run the stage as a background task named after the processor type
    pub fn spawn(self, executor: &TaskExecutor) -> StageHandle {
        self.spawn_named(std::any::type_name::<R>(), executor)
    }

    pub fn spawn_named(self, name: &str, executor: &TaskExecutor) -> StageHandle {
        let stats = self.stats();
        let task = Task::spawn(name, executor, move |ctx| async move { self.run(&ctx).await });
        StageHandle::new(task, stats)
    }
}

#[async_trait]
impl<R: Processor> StageDriver for ProcessorStage<R> {
    type Input = R::Input;

    async fn before_start(&mut self) -> Result<()> {
        self.processor.before_start().await
    }

    async fn next_input(&mut self, ctx: &TaskContext) -> Option<R::Input> {
        self.input.remove_cancellable(ctx.cancellation_token()).await
    }

    async fn step(&mut self, item: R::Input, ctx: &TaskContext) -> Result<Flow> {
        let processor = &mut self.processor;
        let output = &self.output;
        let token = ctx.cancellation_token();

        self.stats
            .timed(async move {
                let processed = processor.process(item).await?;
                // a dropped item is a no-op add
                output.add_cancellable(processed, token).await
            })
            .await?;
        self.stats.record_item();
        Ok(Flow::Continue)
    }

    fn handle_error(&mut self, error: Error) {
        self.processor.handle_error(error);
    }

    async fn finished(&mut self) {
        self.processor.finished().await;
    }
}
