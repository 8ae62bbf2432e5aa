//! Groups of running stages.
//!
//! A [`Pipeline`] holds the [`StageHandle`]s of the stages wired together
//! over shared queues, so they can be stopped and awaited as one unit. The
//! wiring itself happens through the queues each stage is built with.

use futures::future::join_all;

use crate::error::Result;
use crate::stage::{StageHandle, StageSnapshot};

/// Name and counters of one stage in a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageReport {
    pub name: String,
    pub stats: StageSnapshot,
}

/// A set of stages running together.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<StageHandle>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running stage
    pub fn add(&mut self, stage: StageHandle) -> &mut Self {
        tracing::debug!(stage = stage.name(), "Stage added to pipeline");
        self.stages.push(stage);
        self
    }

    /// Builder form of [`Pipeline::add`]
    pub fn with(mut self, stage: StageHandle) -> Self {
        self.add(stage);
        self
    }

    pub fn stages(&self) -> &[StageHandle] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether any stage is still running
    pub fn is_running(&self) -> bool {
        self.stages.iter().any(StageHandle::is_running)
    }

    /// Request every stage to stop.
    pub fn stop(&self) {
        for stage in &self.stages {
            stage.stop();
        }
    }

    /// Wait for every stage to end.
    ///
    /// All stages are awaited even if one fails; the first error in the
    /// order the stages were added is returned.
    pub async fn join(&self) -> Result<()> {
        let results = join_all(self.stages.iter().map(|stage| stage.join())).await;
        let mut first_error = None;
        for (stage, result) in self.stages.iter().zip(results) {
            if let Err(error) = result {
                tracing::error!(stage = stage.name(), error = %error, "Stage failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Counters of every stage, in the order they were added
    pub fn stats(&self) -> Vec<StageReport> {
        self.stages
            .iter()
            .map(|stage| StageReport {
                name: stage.name().to_string(),
                stats: stage.stats().snapshot(),
            })
            .collect()
    }
}
