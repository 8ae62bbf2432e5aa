use std::sync::Arc;

use async_trait::async_trait;

use super::{drive, Flow, StageDriver, StageHandle, StageStats};
use crate::error::{Error, Result};
use crate::queue::{AsyncQueue, ProducerId, ProducerRegistration};
use crate::task::{Task, TaskContext, TaskExecutor};
use crate::traits::Producer;

/// Runs a [`Producer`] into an output queue it is registered on.
///
/// The loop stops when the producer returns `None`, the output queue
/// closes, or the task is stopped. The registration is released once the
/// stage finishes or is dropped without running.
pub struct ProducerStage<P: Producer> {
    producer: P,
    output: Arc<AsyncQueue<P::Item>>,
    registration: ProducerRegistration<P::Item>,
    stats: Arc<StageStats>,
}

impl<P: Producer> ProducerStage<P> {
    /// Create a stage with a private output queue. The queue closes once
    /// this stage is done.
    pub fn new(producer: P) -> Self {
        let output = Arc::new(AsyncQueue::new());
        let stage = Self::with_output(producer, Arc::clone(&output));
        output.close_automatically();
        stage
    }

    /// Create a stage that produces into `output`
    pub fn with_output(producer: P, output: Arc<AsyncQueue<P::Item>>) -> Self {
        let registration = output.register_producer();
        Self {
            producer,
            output,
            registration,
            stats: Arc::new(StageStats::default()),
        }
    }

    pub fn output(&self) -> &Arc<AsyncQueue<P::Item>> {
        &self.output
    }

    /// Handle this stage is registered under on its output queue
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

impl<P> ProducerStage<P>
where
    P: Producer + 'static,
{
    /// Run the stage as a background task named after the producer type
    pub fn spawn(self, executor: &TaskExecutor) -> StageHandle {
        self.spawn_named(std::any::type_name::<P>(), executor)
    }

    pub fn spawn_named(self, name: &str, executor: &TaskExecutor) -> StageHandle {
        let stats = self.stats();
        let task = Task::spawn(name, executor, move |ctx| async move { self.run(&ctx).await });
        StageHandle::new(task, stats)
    }
}

#[async_trait]
impl<P: Producer> StageDriver for ProducerStage<P> {
    type Input = ();

    async fn before_start(&mut self) -> Result<()> {
        self.producer.before_start().await
    }

    async fn next_input(&mut self, _ctx: &TaskContext) -> Option<()> {
        (!self.output.is_closed()).then_some(())
    }

    async fn step(&mut self, _input: (), ctx: &TaskContext) -> Result<Flow> {
        let produced = self.stats.timed(self.producer.produce()).await?;
        let Some(item) = produced else {
            return Ok(Flow::Done);
        };

        self.stats.record_item();
        self.output
            .add_cancellable(item, ctx.cancellation_token())
            .await?;
        Ok(Flow::Continue)
    }

    fn handle_error(&mut self, error: Error) {
        self.producer.handle_error(error);
    }

    async fn finished(&mut self) {
        self.producer.finished().await;
    }
}
