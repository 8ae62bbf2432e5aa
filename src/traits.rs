//! Core traits for pipeline stages.
//!
//! A stage supplies the per-item step and, optionally, the lifecycle hooks
//! around its loop. The loop itself (queue handling, counters, cooperative
//! cancellation) lives in [`crate::stage`].

use crate::error::{Error, Result};
use async_trait::async_trait;

/// A producer generates items for an output queue.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use asyncpipe::error::Result;
/// use asyncpipe::traits::Producer;
///
/// struct CounterProducer {
///     current: u64,
///     max: u64,
/// }
///
/// #[async_trait]
/// impl Producer for CounterProducer {
///     type Item = u64;
///
///     async fn produce(&mut self) -> Result<Option<Self::Item>> {
///         if self.current <= self.max {
///             let item = self.current;
///             self.current += 1;
///             Ok(Some(item))
///         } else {
///             Ok(None) // Signal completion
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Producer: Send {
    /// The type of items this producer generates
    type Item: Send + 'static;

    /// Called once before production starts.
    async fn before_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next item, or `None` when there is nothing more to
    /// produce. `None` ends the stage; it is not an error.
    async fn produce(&mut self) -> Result<Option<Self::Item>>;

    /// Called with every error returned by [`Producer::produce`]. The stage
    /// keeps running afterwards.
    fn handle_error(&mut self, error: Error) {
        tracing::warn!(error = %error, "Failed to produce!");
    }

    /// Called once after the production loop ends, for whatever reason.
    async fn finished(&mut self) {}
}

/// A consumer processes every item of an input queue.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use asyncpipe::error::Result;
/// use asyncpipe::traits::Consumer;
///
/// struct LogConsumer;
///
/// #[async_trait]
/// impl Consumer for LogConsumer {
///     type Item = String;
///
///     async fn consume(&mut self, item: Self::Item) -> Result<()> {
///         println!("Consumed: {}", item);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Consumer: Send {
    /// The type of items this consumer accepts
    type Item: Send + 'static;

    /// Called once before consumption starts.
    async fn before_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process a single item.
    async fn consume(&mut self, item: Self::Item) -> Result<()>;

    /// Called with every error returned by [`Consumer::consume`]. The stage
    /// moves on to the next item afterwards.
    ///
    /// The failing item was moved into `consume` and is gone by now, so an
    /// error that needs to name it has to carry it, e.g.
    /// `Error::custom(format!("bad record {item:?}"))`.
    fn handle_error(&mut self, error: Error) {
        tracing::warn!(error = %error, "Failed to consume!");
    }

    /// Called once after the consumption loop ends, for whatever reason.
    async fn finished(&mut self) {}
}

/// A processor transforms items from an input queue into an output queue.
///
/// Returning `Ok(None)` from [`Processor::process`] drops the item.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use asyncpipe::error::Result;
/// use asyncpipe::traits::Processor;
///
/// struct DoubleProcessor;
///
/// #[async_trait]
/// impl Processor for DoubleProcessor {
///     type Input = i32;
///     type Output = i32;
///
///     async fn process(&mut self, item: Self::Input) -> Result<Option<Self::Output>> {
///         Ok(Some(item * 2))
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send {
    /// The type of items this processor accepts
    type Input: Send + 'static;
    /// The type of items this processor produces
    type Output: Send + 'static;

    /// Called once before processing starts.
    async fn before_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Transform an input item into an output item, or `None` to drop it.
    async fn process(&mut self, item: Self::Input) -> Result<Option<Self::Output>>;

    /// Called with every error from [`Processor::process`] or from writing
    /// its result downstream. As with [`Consumer::handle_error`], the input
    /// item is not passed back; put what is needed into the error.
    fn handle_error(&mut self, error: Error) {
        tracing::warn!(error = %error, "Failed to process!");
    }

    /// Called once after the processing loop ends, before the output queue
    /// is released.
    async fn finished(&mut self) {}
}
