//! Error types for queues and pipeline stages.

use std::sync::Arc;

/// The main error type for queues, stages and tasks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An item was written to a queue that had already been closed.
    ///
    /// This is a contract violation: a stage kept writing after it (or the
    /// queue's owner) declared the stream finished.
    #[error("Can't add to closed queue [{queue}]")]
    QueueClosed { queue: String },

    /// A producer failed to generate an item
    #[error("Producer error: {0}")]
    Producer(Arc<dyn std::error::Error + Send + Sync>),

    /// A consumer failed to process an item
    #[error("Consumer error: {0}")]
    Consumer(Arc<dyn std::error::Error + Send + Sync>),

    /// A processor failed to transform an item
    #[error("Processor error: {0}")]
    Processor(Arc<dyn std::error::Error + Send + Sync>),

    /// A spawned task panicked or was aborted
    #[error("Task [{task}] panicked: {message}")]
    TaskPanicked { task: String, message: String },

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a producer error from any error type
    pub fn producer<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Producer(Arc::new(error))
    }

    /// Create a consumer error from any error type
    pub fn consumer<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Consumer(Arc::new(error))
    }

    /// Create a processor error from any error type
    pub fn processor<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Processor(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Returns `true` if this is a write to a closed queue.
    pub fn is_queue_closed(&self) -> bool {
        matches!(self, Error::QueueClosed { .. })
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Custom(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting errors into our Error type
pub trait IntoError<T> {
    fn into_producer_error(self) -> Result<T>;
    fn into_consumer_error(self) -> Result<T>;
    fn into_processor_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_producer_error(self) -> Result<T> {
        self.map_err(Error::producer)
    }

    fn into_consumer_error(self) -> Result<T> {
        self.map_err(Error::consumer)
    }

    fn into_processor_error(self) -> Result<T> {
        self.map_err(Error::processor)
    }
}
