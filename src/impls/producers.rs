//! Concrete producer implementations.

use async_trait::async_trait;

use crate::error::Result;
use crate::traits::Producer;

/// A producer that yields the items of an iterator, then ends the stage.
pub struct IterProducer<I> {
    iter: I,
}

impl<I> IterProducer<I>
where
    I: Iterator,
{
    pub fn new<T>(items: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: items.into_iter(),
        }
    }
}

#[async_trait]
impl<I> Producer for IterProducer<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    async fn produce(&mut self) -> Result<Option<Self::Item>> {
        Ok(self.iter.next())
    }
}

/// Create a producer over the items of `items`
pub fn from_iter<T>(items: T) -> IterProducer<T::IntoIter>
where
    T: IntoIterator,
{
    IterProducer::new(items)
}

/// A producer that repeats a single value
pub struct RepeatProducer<T> {
    value: T,
    remaining: Option<usize>,
}

impl<T: Clone> RepeatProducer<T> {
    /// Create a producer that repeats a value until its task is stopped
    pub fn new(value: T) -> Self {
        Self {
            value,
            remaining: None,
        }
    }

    /// Create a producer that repeats a value n times
    pub fn times(value: T, count: usize) -> Self {
        Self {
            value,
            remaining: Some(count),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Producer for RepeatProducer<T> {
    type Item = T;

    async fn produce(&mut self) -> Result<Option<Self::Item>> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        Ok(Some(self.value.clone()))
    }
}
