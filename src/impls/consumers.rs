//! Concrete consumer implementations.

use async_trait::async_trait;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::error::Result;
use crate::traits::Consumer;

/// Writes every item to stdout, one per line, optionally behind a label.
pub struct PrintConsumer<T> {
    label: Option<String>,
    printed: u64,
    _phantom: PhantomData<fn(T)>,
}

impl<T> PrintConsumer<T> {
    pub fn new() -> Self {
        Self {
            label: None,
            printed: 0,
            _phantom: PhantomData,
        }
    }

    /// Print items as `"<label>: <item>"`
    pub fn with_prefix(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new()
        }
    }
}

#[async_trait]
impl<T: Display + Send + 'static> Consumer for PrintConsumer<T> {
    type Item = T;

    async fn consume(&mut self, item: T) -> Result<()> {
        match &self.label {
            Some(label) => println!("{}: {}", label, item),
            None => println!("{}", item),
        }
        self.printed += 1;
        Ok(())
    }

    async fn finished(&mut self) {
        tracing::debug!(label = ?self.label, printed = self.printed, "Done printing");
    }
}

/// Appends every item to a vector shared with [`CollectConsumer::items`].
pub struct CollectConsumer<T> {
    items: Arc<TokioMutex<Vec<T>>>,
}

impl<T: Send + 'static> CollectConsumer<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(TokioMutex::new(Vec::new())),
        }
    }

    /// The collected items, readable while the stage runs and after it ends
    pub fn items(&self) -> Arc<TokioMutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

#[async_trait]
impl<T: Send + 'static> Consumer for CollectConsumer<T> {
    type Item = T;

    async fn consume(&mut self, item: T) -> Result<()> {
        self.items.lock().await.push(item);
        Ok(())
    }
}

/// Counts items and discards them.
///
/// Clones share the counter, so a clone kept outside the stage can read it.
pub struct CountConsumer<T> {
    seen: Arc<AtomicU64>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> CountConsumer<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(AtomicU64::new(0)),
            _phantom: PhantomData,
        }
    }

    pub fn count(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl<T> Clone for CountConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Consumer for CountConsumer<T> {
    type Item = T;

    async fn consume(&mut self, _item: T) -> Result<()> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
