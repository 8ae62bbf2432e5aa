//! Managed background tasks that pipeline stages run inside of.
//!
//! A [`Task`] runs one async body on a [`TaskExecutor`] and exposes the
//! controls a stage loop cooperates with: a stop request, pause/resume and
//! a progress counter. The body sees these through a [`TaskContext`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Name of the executor used when none is given.
pub const DEFAULT_EXECUTOR: &str = "default";

static EXECUTORS: Lazy<DashMap<String, Handle>> = Lazy::new(DashMap::new);
static TASK_INDEXES: Lazy<DashMap<String, AtomicU64>> = Lazy::new(DashMap::new);

/// A named pool that tasks are spawned onto.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    name: String,
    handle: Option<Handle>,
}

impl TaskExecutor {
    /// Create an executor backed by the given runtime handle
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle: Some(handle),
        }
    }

    /// Register a named executor so that [`TaskExecutor::named`] can find it
    pub fn register(name: impl Into<String>, handle: Handle) -> Self {
        let name = name.into();
        debug!(executor = %name, "Registering executor");
        EXECUTORS.insert(name.clone(), handle.clone());
        Self::new(name, handle)
    }

    /// Look up a registered executor, falling back to the default one.
    pub fn named(name: &str) -> Self {
        match EXECUTORS.get(name) {
            Some(handle) => Self::new(name, handle.value().clone()),
            None => {
                debug!(executor = %name, "No such executor, using the default");
                Self::default()
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.handle {
            Some(handle) => handle.spawn(future),
            None => tokio::spawn(future),
        }
    }
}

/// Spawns onto the runtime that is current when the task is spawned.
impl Default for TaskExecutor {
    fn default() -> Self {
        Self {
            name: DEFAULT_EXECUTOR.to_string(),
            handle: None,
        }
    }
}

#[derive(Debug, Default)]
struct RunTimes {
    begin: Option<Instant>,
    end: Option<Instant>,
}

#[derive(Debug)]
struct TaskState {
    name: String,
    executor: String,
    token: CancellationToken,
    pause_requested: AtomicBool,
    resumed: Notify,
    running: AtomicBool,
    progress_index: AtomicU64,
    progress_total: AtomicI64,
    run_count: AtomicU64,
    times: Mutex<RunTimes>,
    last_error: Mutex<Option<Error>>,
}

impl TaskState {
    fn new(name: &str, executor: &str) -> Self {
        let index = TASK_INDEXES
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1;

        Self {
            name: format!("{} #{}", name, index),
            executor: executor.to_string(),
            token: CancellationToken::new(),
            pause_requested: AtomicBool::new(false),
            resumed: Notify::new(),
            running: AtomicBool::new(false),
            progress_index: AtomicU64::new(0),
            progress_total: AtomicI64::new(-1),
            run_count: AtomicU64::new(0),
            times: Mutex::new(RunTimes::default()),
            last_error: Mutex::new(None),
        }
    }

    fn begin(&self) {
        self.running.store(true, Ordering::Release);
        let mut times = self.times.lock().unwrap_or_else(PoisonError::into_inner);
        times.begin = Some(Instant::now());
        times.end = None;
    }

    fn end(&self) {
        self.times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .end = Some(Instant::now());
        self.run_count.fetch_add(1, Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }

    fn set_last_error(&self, error: Error) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Marks the run finished even if the body panics or is aborted.
struct RunGuard(Arc<TaskState>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        debug!(task = %self.0.name, "End running");
        self.0.end();
    }
}

/// The view of a task that its body gets to see.
#[derive(Debug, Clone)]
pub struct TaskContext {
    state: Arc<TaskState>,
}

impl TaskContext {
    /// Create a context that is not attached to a spawned task, for running
    /// a stage inline.
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(TaskState::new(name, DEFAULT_EXECUTOR)),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Returns `false` once the task has been asked to stop. While the task
    /// is paused, waits until it is resumed or stopped.
    pub async fn should_continue(&self) -> bool {
        loop {
            if self.state.token.is_cancelled() {
                return false;
            }

            let resumed = self.state.resumed.notified();
            if !self.state.pause_requested.load(Ordering::Acquire) {
                return true;
            }

            tokio::select! {
                _ = self.state.token.cancelled() => return false,
                _ = resumed => {}
            }
        }
    }

    /// Token that is cancelled when the task is asked to stop
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.state.token
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.token.is_cancelled()
    }

    pub fn add_progress(&self, amount: u64) {
        self.state.progress_index.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn progress_index(&self) -> u64 {
        self.state.progress_index.load(Ordering::Relaxed)
    }

    pub fn set_progress_total(&self, total: u64) {
        let total = i64::try_from(total).unwrap_or(i64::MAX);
        self.state.progress_total.store(total, Ordering::Relaxed);
    }

    /// Handle to the task this context belongs to, without the join handle.
    fn detach(&self) -> Task {
        Task {
            state: Arc::clone(&self.state),
            join: Mutex::new(None),
        }
    }
}

/// A spawned background task.
#[derive(Debug)]
pub struct Task {
    state: Arc<TaskState>,
    join: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Task {
    /// Spawn `body` on `executor`.
    ///
    /// The task is named `"<name> #<n>"`, where `n` counts the tasks
    /// created with the same `name`. Errors returned by the body are logged
    /// and kept as [`Task::last_error`].
    pub fn spawn<F, Fut>(name: &str, executor: &TaskExecutor, body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = TaskContext {
            state: Arc::new(TaskState::new(name, executor.name())),
        };
        let state = Arc::clone(&ctx.state);
        state.begin();
        // dropped with the future, even if it is never polled
        let guard = RunGuard(Arc::clone(&state));

        let handle = executor.spawn(async move {
            debug!(task = %ctx.name(), executor = %ctx.state.executor, "Begin running");

            let result = if ctx.should_continue().await {
                body(ctx.clone()).await
            } else {
                Ok(())
            };

            if let Err(error) = &result {
                warn!(task = %ctx.name(), error = %error, "Error running task");
                guard.0.set_last_error(error.clone());
            }
            drop(guard);
            result
        });

        Self {
            state,
            join: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn executor_name(&self) -> &str {
        &self.state.executor
    }

    /// A context sharing this task's controls and progress.
    pub fn context(&self) -> TaskContext {
        TaskContext {
            state: Arc::clone(&self.state),
        }
    }

    /// Asks the task to stop. Stages notice at their next loop iteration
    /// or while waiting on a queue.
    pub fn stop(&self) {
        if !self.state.token.is_cancelled() {
            debug!(task = %self.state.name, "Stopping");
            self.state.token.cancel();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.token.is_cancelled()
    }

    pub fn pause(&self) {
        if self
            .state
            .pause_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(task = %self.state.name, "Pausing");
        }
    }

    pub fn resume(&self) {
        if self
            .state
            .pause_requested
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(task = %self.state.name, "Resuming");
            self.state.resumed.notify_waiters();
        }
    }

    pub fn is_pause_requested(&self) -> bool {
        self.state.pause_requested.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn progress_index(&self) -> u64 {
        self.state.progress_index.load(Ordering::Relaxed)
    }

    /// `None` if the total isn't known.
    pub fn progress_total(&self) -> Option<u64> {
        u64::try_from(self.state.progress_total.load(Ordering::Relaxed)).ok()
    }

    /// Progress as `index/?` or `index/total (percent%)`.
    pub fn progress(&self) -> String {
        let index = self.progress_index();
        match self.progress_total() {
            Some(total) if total > 0 => format!(
                "{}/{} ({:.1}%)",
                index,
                total,
                index as f64 / total as f64 * 100.0
            ),
            Some(total) => format!("{}/{}", index, total),
            None => format!("{}/?", index),
        }
    }

    pub fn run_count(&self) -> u64 {
        self.state.run_count.load(Ordering::Relaxed)
    }

    /// Error returned by the last run, if any
    pub fn last_error(&self) -> Option<Error> {
        self.state.last_error()
    }

    /// How long the task has been running, or ran for if it's finished.
    pub fn run_duration(&self) -> Option<Duration> {
        let times = self.state.times.lock().unwrap_or_else(PoisonError::into_inner);
        let begin = times.begin?;
        Some(times.end.unwrap_or_else(Instant::now).duration_since(begin))
    }

    /// Waits for the task to finish and returns the body's result.
    ///
    /// Joining again returns the recorded last error, if any.
    pub async fn join(&self) -> Result<()> {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let error = Error::TaskPanicked {
                        task: self.state.name.clone(),
                        message: e.to_string(),
                    };
                    self.state.set_last_error(error.clone());
                    Err(error)
                }
            },
            None => match self.last_error() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        }
    }
}

impl From<&TaskContext> for Task {
    fn from(ctx: &TaskContext) -> Self {
        ctx.detach()
    }
}
