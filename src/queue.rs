//! Bounded, closeable queue shared between pipeline stages.
//!
//! An [`AsyncQueue`] is the only resource stages share. Writers suspend in
//! [`AsyncQueue::add`] while the queue is full and readers suspend in
//! [`AsyncQueue::remove`] while it is empty. Both wait in short bounded
//! slices (see [`QueueConfig::poll_interval`]) so that closing the queue or
//! cancelling the waiting stage is observed promptly.
//!
//! Closing is one-way. Once closed, no more items can be added, but buffered
//! items can still be drained; `remove` then returns `None` forever, which is
//! the end-of-stream signal consumers stop on.
//!
//! Producers declare themselves on the queue with
//! [`AsyncQueue::register_producer`]. With [`AsyncQueue::close_automatically`]
//! armed, the queue closes itself once the last registered producer leaves,
//! which is how shutdown cascades down a chain of stages.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures::Stream;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default capacity of a queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 250;

/// Default length of a single wait slice in `add` and `remove`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a queue
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueConfig {
    /// Maximum number of buffered items
    pub capacity: usize,
    /// How long a blocked `add` or `remove` waits before re-checking state
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Set the capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Opaque handle identifying a registered producer of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

/// Reaction to a waiting `add` or `remove` being cancelled.
///
/// `item` is the item that was being added, or `None` when the
/// cancellation happened during a `remove`.
pub trait InterruptHandler<E>: Send + Sync {
    fn handle_interrupt(&self, queue: &AsyncQueue<E>, item: Option<&E>);
}

/// Default interrupt policy: close the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOnInterrupt;

impl<E> InterruptHandler<E> for CloseOnInterrupt {
    fn handle_interrupt(&self, queue: &AsyncQueue<E>, _item: Option<&E>) {
        queue.close();
    }
}

/// Point-in-time view of a queue's state and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueStats {
    pub id: String,
    pub len: usize,
    pub capacity: usize,
    pub closed: bool,
    pub producers: usize,
    pub add_success_count: u64,
    pub add_failure_count: u64,
    pub add_wait: Duration,
    pub remove_count: u64,
    pub remove_wait: Duration,
}

/// A bounded multi-producer multi-consumer queue that can be closed for
/// writing while it is still being drained.
pub struct AsyncQueue<E> {
    id: Uuid,
    config: QueueConfig,
    items: Mutex<VecDeque<E>>,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    close_automatically: AtomicBool,
    producers: DashSet<ProducerId>,
    next_producer_id: AtomicU64,
    interrupt_handler: Box<dyn InterruptHandler<E>>,

    add_success_count: AtomicU64,
    add_failure_count: AtomicU64,
    add_wait_nanos: AtomicU64,
    remove_count: AtomicU64,
    remove_wait_nanos: AtomicU64,
}

impl<E> AsyncQueue<E> {
    /// Create an open queue with the default capacity
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create an open queue holding at most `capacity` items.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(QueueConfig::default().capacity(capacity))
    }

    /// Create an open queue from a configuration
    pub fn with_config(mut config: QueueConfig) -> Self {
        config.capacity = config.capacity.max(1);
        let queue = Self {
            id: Uuid::new_v4(),
            items: Mutex::new(VecDeque::with_capacity(config.capacity)),
            config,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
            close_automatically: AtomicBool::new(false),
            producers: DashSet::new(),
            next_producer_id: AtomicU64::new(0),
            interrupt_handler: Box::new(CloseOnInterrupt),
            add_success_count: AtomicU64::new(0),
            add_failure_count: AtomicU64::new(0),
            add_wait_nanos: AtomicU64::new(0),
            remove_count: AtomicU64::new(0),
            remove_wait_nanos: AtomicU64::new(0),
        };
        debug!(queue = %queue.id, capacity = queue.config.capacity, "Creating queue");
        queue
    }

    /// Replace the reaction to cancelled waits
    pub fn with_interrupt_handler<H>(mut self, handler: H) -> Self
    where
        H: InterruptHandler<E> + 'static,
    {
        self.interrupt_handler = Box::new(handler);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    /// Returns `true` once the queue has been closed. Never reverts.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if the queue will close once its producers are gone.
    pub fn is_close_automatically(&self) -> bool {
        self.close_automatically.load(Ordering::Acquire)
    }

    /// Closes this queue so that no more items can be added. Buffered items
    /// are unaffected and remain available to `remove`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.id, "Closing queue");
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Arms the queue to close once its producer set becomes empty. Closes
    /// right away if no producer is registered.
    pub fn close_automatically(&self) {
        self.close_automatically.store(true, Ordering::Release);
        if self.producers.is_empty() {
            self.close();
        }
    }

    /// Declares a new producer of this queue and returns its handle.
    ///
    /// Prefer [`AsyncQueue::register_producer`], which releases the handle
    /// when dropped.
    pub fn add_producer(&self) -> ProducerId {
        let id = ProducerId(self.next_producer_id.fetch_add(1, Ordering::Relaxed));
        debug!(queue = %self.id, producer = %id, "Adding producer");
        self.producers.insert(id);
        id
    }

    /// Removes a producer. Removing the last one closes the queue if
    /// automatic closing is armed.
    pub fn remove_producer(&self, id: ProducerId) -> bool {
        debug!(queue = %self.id, producer = %id, "Removing producer");
        let removed = self.producers.remove(&id).is_some();
        if self.is_close_automatically() && self.producers.is_empty() {
            self.close();
        }
        removed
    }

    pub fn has_producer(&self, id: ProducerId) -> bool {
        self.producers.contains(&id)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn add_success_count(&self) -> u64 {
        self.add_success_count.load(Ordering::Relaxed)
    }

    pub fn add_failure_count(&self) -> u64 {
        self.add_failure_count.load(Ordering::Relaxed)
    }

    /// Cumulative time spent inside `add`
    pub fn add_wait(&self) -> Duration {
        Duration::from_nanos(self.add_wait_nanos.load(Ordering::Relaxed))
    }

    pub fn remove_count(&self) -> u64 {
        self.remove_count.load(Ordering::Relaxed)
    }

    /// Cumulative time spent inside `remove`
    pub fn remove_wait(&self) -> Duration {
        Duration::from_nanos(self.remove_wait_nanos.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            id: self.id.to_string(),
            len: self.len(),
            capacity: self.capacity(),
            closed: self.is_closed(),
            producers: self.producer_count(),
            add_success_count: self.add_success_count(),
            add_failure_count: self.add_failure_count(),
            add_wait: self.add_wait(),
            remove_count: self.remove_count(),
            remove_wait: self.remove_wait(),
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<E>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> Error {
        Error::QueueClosed {
            queue: self.id.to_string(),
        }
    }

    fn try_push(&self, item: E) -> std::result::Result<(), E> {
        let mut items = self.lock_items();
        if items.len() >= self.config.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    fn poll_item(&self) -> Option<E> {
        let item = self.lock_items().pop_front();
        if item.is_some() {
            self.remove_count.fetch_add(1, Ordering::Relaxed);
            self.not_full.notify_one();
            #[cfg(feature = "metrics")]
            metrics::counter!("asyncpipe_queue_removed_total", "queue" => self.id.to_string())
                .increment(1);
        }
        item
    }

    fn handle_interrupt(&self, item: Option<&E>) {
        debug!(queue = %self.id, adding = item.is_some(), "Interrupted while waiting");
        self.interrupt_handler.handle_interrupt(self, item);
    }
}

impl<E: Send> AsyncQueue<E> {
    /// Adds `item` to this queue, waiting for space if the queue is full.
    ///
    /// `None` is never stored: it counts as a failed add and returns
    /// `Ok(false)` without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::QueueClosed`] if the queue is closed when called, or is
    /// closed while waiting for space.
    pub async fn add(&self, item: impl Into<Option<E>>) -> Result<bool> {
        self.add_inner(item.into(), None).await
    }

    /// Like [`AsyncQueue::add`], but a cancelled `token` while waiting is
    /// handed to the interrupt handler, which closes the queue by default.
    pub async fn add_cancellable(
        &self,
        item: impl Into<Option<E>>,
        token: &CancellationToken,
    ) -> Result<bool> {
        self.add_inner(item.into(), Some(token)).await
    }

    /// Removes the next item, waiting while the queue is open and empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub async fn remove(&self) -> Option<E> {
        self.remove_inner(None).await
    }

    /// Like [`AsyncQueue::remove`], but a cancelled `token` while waiting
    /// is handed to the interrupt handler, which closes the queue by default.
    pub async fn remove_cancellable(&self, token: &CancellationToken) -> Option<E> {
        self.remove_inner(Some(token)).await
    }

    async fn add_inner(&self, item: Option<E>, interrupt: Option<&CancellationToken>) -> Result<bool> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let started = Instant::now();
        let result = match item {
            Some(item) => self.offer(item, interrupt).await,
            None => {
                self.add_failure_count.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        };
        self.add_wait_nanos
            .fetch_add(elapsed_nanos(started), Ordering::Relaxed);
        result
    }

    async fn offer(&self, mut item: E, mut interrupt: Option<&CancellationToken>) -> Result<bool> {
        loop {
            let space = self.not_full.notified();
            if self.is_closed() {
                return Err(self.closed_error());
            }

            match self.try_push(item) {
                Ok(()) => {
                    self.add_success_count.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    #[cfg(feature = "metrics")]
                    metrics::counter!("asyncpipe_queue_added_total", "queue" => self.id.to_string())
                        .increment(1);
                    return Ok(true);
                }
                Err(rejected) => item = rejected,
            }

            if self.wait(space, interrupt).await {
                self.handle_interrupt(Some(&item));
                // one interrupt per call
                interrupt = None;
            }
        }
    }

    async fn remove_inner(&self, mut interrupt: Option<&CancellationToken>) -> Option<E> {
        let started = Instant::now();
        let item = loop {
            let available = self.not_empty.notified();
            if self.is_closed() {
                break self.poll_item();
            }
            if let Some(item) = self.poll_item() {
                break Some(item);
            }

            if self.wait(available, interrupt).await {
                self.handle_interrupt(None);
                interrupt = None;
            }
        };
        self.remove_wait_nanos
            .fetch_add(elapsed_nanos(started), Ordering::Relaxed);
        item
    }

    /// Waits one poll slice. Returns `true` if `interrupt` fired.
    async fn wait(&self, wakeup: Notified<'_>, interrupt: Option<&CancellationToken>) -> bool {
        let slice = tokio::time::timeout(self.config.poll_interval, wakeup);
        match interrupt {
            Some(token) => tokio::select! {
                _ = token.cancelled() => true,
                _ = slice => false,
            },
            None => {
                let _ = slice.await;
                false
            }
        }
    }
}

impl<E: Send + 'static> AsyncQueue<E> {
    /// Registers a producer that is removed again when the returned guard
    /// is dropped.
    pub fn register_producer(self: &Arc<Self>) -> ProducerRegistration<E> {
        ProducerRegistration {
            id: self.add_producer(),
            queue: Arc::clone(self),
        }
    }

    /// Streams the remaining items until end-of-stream.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = E> + Send {
        futures::stream::unfold(self, |queue| async move {
            let item = queue.remove().await?;
            Some((item, queue))
        })
    }
}

impl<E> Default for AsyncQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Display for AsyncQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<E> fmt::Debug for AsyncQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .field("closed", &self.is_closed())
            .field("producers", &self.producer_count())
            .finish()
    }
}

/// Membership of a producer in a queue's producer set.
///
/// Dropping the registration removes the producer, which may close the
/// queue if automatic closing is armed.
pub struct ProducerRegistration<E> {
    queue: Arc<AsyncQueue<E>>,
    id: ProducerId,
}

impl<E> ProducerRegistration<E> {
    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn queue(&self) -> &Arc<AsyncQueue<E>> {
        &self.queue
    }
}

impl<E> Drop for ProducerRegistration<E> {
    fn drop(&mut self) {
        self.queue.remove_producer(self.id);
    }
}

impl<E> fmt::Debug for ProducerRegistration<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerRegistration")
            .field("queue", &self.queue.id)
            .field("id", &self.id)
            .finish()
    }
}

fn elapsed_nanos(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn none_is_counted_as_failed_add() {
        let queue = AsyncQueue::<i32>::with_capacity(2);

        assert!(!assert_ok!(queue.add(None).await));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.add_failure_count(), 1);
        assert_eq!(queue.add_success_count(), 0);

        assert!(assert_ok!(queue.add(7).await));
        assert_eq!(queue.add_success_count(), 1);
        assert_eq!(queue.add_failure_count(), 1);
    }

    #[tokio::test]
    async fn add_after_close_fails_loudly() {
        let queue = AsyncQueue::<i32>::new();
        queue.close();

        let error = assert_err!(queue.add(1).await);
        assert!(error.is_queue_closed());
        // even a None is rejected once closed
        assert!(assert_err!(queue.add(None).await).is_queue_closed());
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let queue = AsyncQueue::<u8>::with_capacity(0);
        assert_eq!(queue.capacity(), 1);
        assert_ok!(queue.add(1).await);
    }

    #[tokio::test]
    async fn close_keeps_buffered_items() {
        let queue = AsyncQueue::<&str>::new();
        queue.add("a").await.unwrap();
        queue.add("b").await.unwrap();
        queue.close();
        queue.close();

        assert_eq!(queue.remove().await, Some("a"));
        assert_eq!(queue.remove().await, Some("b"));
        assert_eq!(queue.remove().await, None);
        assert_eq!(queue.remove_count(), 2);
    }

    #[tokio::test]
    async fn closed_empty_remove_returns_immediately() {
        let queue = AsyncQueue::<i32>::new();
        queue.close();

        for _ in 0..3 {
            let item = timeout(Duration::from_millis(5), queue.remove()).await;
            assert_eq!(item.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn full_add_waits_for_remove() {
        let queue = Arc::new(AsyncQueue::<i32>::with_capacity(2));
        queue.add(1).await.unwrap();
        queue.add(2).await.unwrap();

        assert!(timeout(Duration::from_millis(50), queue.add(3)).await.is_err());

        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.add(3).await })
        };
        assert_eq!(queue.remove().await, Some(1));
        assert!(writer.await.unwrap().unwrap());
        assert_eq!(queue.remove().await, Some(2));
        assert_eq!(queue.remove().await, Some(3));
    }

    #[tokio::test]
    async fn full_add_fails_when_queue_closes() {
        let queue = Arc::new(AsyncQueue::<i32>::with_capacity(1));
        queue.add(1).await.unwrap();

        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.add(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert!(assert_err!(result).is_queue_closed());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_automatically_without_producers_closes_now() {
        let queue = AsyncQueue::<i32>::new();
        queue.close_automatically();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn last_producer_leaving_closes_armed_queue() {
        let queue = Arc::new(AsyncQueue::<i32>::new());
        let first = queue.register_producer();
        let second = queue.register_producer();
        queue.close_automatically();
        assert!(!queue.is_closed());
        assert_eq!(queue.producer_count(), 2);

        drop(first);
        assert!(!queue.is_closed());
        drop(second);
        assert!(queue.is_closed());
        assert_eq!(queue.producer_count(), 0);
    }

    #[tokio::test]
    async fn producers_leaving_unarmed_queue_keep_it_open() {
        let queue = Arc::new(AsyncQueue::<i32>::new());
        let id = queue.add_producer();
        assert!(queue.has_producer(id));
        assert!(queue.remove_producer(id));
        assert!(!queue.remove_producer(id));
        assert!(!queue.is_closed());
    }

    #[tokio::test]
    async fn cancelled_remove_closes_queue() {
        let queue = Arc::new(AsyncQueue::<i32>::new());
        let token = CancellationToken::new();

        let reader = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.remove_cancellable(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let item = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(item, None);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn cancelled_add_closes_queue() {
        let queue = AsyncQueue::<i32>::with_capacity(1);
        queue.add(1).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = queue.add_cancellable(2, &token).await;
        assert!(assert_err!(result).is_queue_closed());
        assert!(queue.is_closed());
        assert_eq!(queue.remove().await, Some(1));
    }

    struct CountingHandler(Arc<AtomicUsize>);

    impl InterruptHandler<i32> for CountingHandler {
        fn handle_interrupt(&self, _queue: &AsyncQueue<i32>, item: Option<&i32>) {
            assert_eq!(item, Some(&2));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn custom_interrupt_handler_replaces_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(
            AsyncQueue::<i32>::with_capacity(1).with_interrupt_handler(CountingHandler(calls.clone())),
        );
        queue.add(1).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let writer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.add_cancellable(2, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!queue.is_closed());
        assert_eq!(queue.remove().await, Some(1));

        assert!(writer.await.unwrap().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.remove().await, Some(2));
    }

    #[tokio::test]
    async fn stream_ends_at_end_of_stream() {
        use futures::StreamExt;

        let queue = Arc::new(AsyncQueue::<i32>::new());
        for i in 0..4 {
            queue.add(i).await.unwrap();
        }
        queue.close();

        let items: Vec<i32> = Arc::clone(&queue).into_stream().collect().await;
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn stats_snapshot_reflects_counters() {
        let queue = Arc::new(AsyncQueue::<i32>::with_capacity(4));
        let _registration = queue.register_producer();
        queue.add(1).await.unwrap();
        queue.add(None).await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.producers, 1);
        assert_eq!(stats.add_success_count, 1);
        assert_eq!(stats.add_failure_count, 1);
        assert_eq!(stats.remove_count, 0);
        assert!(!stats.closed);
        assert_eq!(stats.id, queue.to_string());
    }
}
