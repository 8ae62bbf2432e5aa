//! Concrete processor implementations.

use async_trait::async_trait;
use std::marker::PhantomData;

use crate::error::Result;
use crate::traits::Processor;

/// A processor that maps items using a function.
pub struct MapProcessor<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

impl<F, T, U> MapProcessor<F, T, U> {
    /// Create a new map processor
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, U> Processor for MapProcessor<F, T, U>
where
    F: FnMut(T) -> U + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&mut self, item: Self::Input) -> Result<Option<Self::Output>> {
        Ok(Some((self.f)(item)))
    }
}

/// A processor that only passes items satisfying a predicate.
pub struct FilterProcessor<F, T> {
    predicate: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> FilterProcessor<F, T> {
    /// Create a new filter processor
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> Processor for FilterProcessor<F, T>
where
    F: FnMut(&T) -> bool + Send + 'static,
    T: Send + 'static,
{
    type Input = T;
    type Output = T;

    async fn process(&mut self, item: Self::Input) -> Result<Option<Self::Output>> {
        if (self.predicate)(&item) {
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }
}
