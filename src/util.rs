//! Adapters that turn closures into stages.

use async_trait::async_trait;
use std::future::Future;

use crate::error::Result;
use crate::traits::{Consumer, Processor, Producer};

/// Helper function to create a simple producer from a function
///
/// The producer ends when the future resolves to `Ok(None)`.
pub fn producer_from_fn<F, Fut, T>(f: F) -> FnProducer<F, Fut, T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send + 'static,
{
    FnProducer {
        f,
        _phantom: std::marker::PhantomData,
    }
}

/// A producer created from a function
pub struct FnProducer<F, Fut, T> {
    f: F,
    _phantom: std::marker::PhantomData<fn() -> (Fut, T)>,
}

#[async_trait]
impl<F, Fut, T> Producer for FnProducer<F, Fut, T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send + 'static,
{
    type Item = T;

    async fn produce(&mut self) -> Result<Option<Self::Item>> {
        (self.f)().await
    }
}

/// Helper function to create a simple consumer from a function
pub fn consumer_from_fn<F, Fut, T>(f: F) -> FnConsumer<F, Fut, T>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
    T: Send + 'static,
{
    FnConsumer {
        f,
        _phantom: std::marker::PhantomData,
    }
}

/// A consumer created from a function
pub struct FnConsumer<F, Fut, T> {
    f: F,
    _phantom: std::marker::PhantomData<fn(T) -> Fut>,
}

#[async_trait]
impl<F, Fut, T> Consumer for FnConsumer<F, Fut, T>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
    T: Send + 'static,
{
    type Item = T;

    async fn consume(&mut self, item: Self::Item) -> Result<()> {
        (self.f)(item).await
    }
}

/// Helper function to create a simple processor from a function
///
/// Resolving to `Ok(None)` drops the item.
pub fn processor_from_fn<F, Fut, T, U>(f: F) -> FnProcessor<F, Fut, T, U>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<Option<U>>> + Send,
    T: Send + 'static,
    U: Send + 'static,
{
    FnProcessor {
        f,
        _phantom: std::marker::PhantomData,
    }
}

/// A processor created from a function
pub struct FnProcessor<F, Fut, T, U> {
    f: F,
    _phantom: std::marker::PhantomData<fn(T) -> (Fut, U)>,
}

#[async_trait]
impl<F, Fut, T, U> Processor for FnProcessor<F, Fut, T, U>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<Option<U>>> + Send,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&mut self, item: Self::Input) -> Result<Option<Self::Output>> {
        (self.f)(item).await
    }
}
