//! Task scheduling with cooperative cancellation.
//!
//! Two logical pools: a scheduled pool for delayed/periodic tasks and an
//! async pool for immediate background work, both bounded by semaphores.
//! Every task owns a cancellation token; `cancel` is cooperative and
//! non-interrupting, `cancel_now` aborts.

use dashmap::DashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Monotonic task identifier.
pub type TaskId = u64;

/// Scheduler counters.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    /// Tasks currently tracked (pending or running).
    pub active: usize,
    /// Tasks submitted since startup.
    pub submitted: u64,
    /// Task bodies that ran to completion (including panics caught).
    pub completed: u64,
}

struct TaskEntry {
    token: CancellationToken,
    abort: AbortHandle,
    repeating: bool,
    owner: Option<String>,
    created_at: Instant,
}

/// Task scheduler.
pub struct TaskScheduler {
    tasks: Arc<DashMap<TaskId, TaskEntry>>,
    next_id: AtomicU64,
    scheduled_permits: Arc<Semaphore>,
    async_permits: Arc<Semaphore>,
    tracker: TaskTracker,
    root: CancellationToken,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("active", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(crate::SCHEDULED_POOL_SIZE, crate::ASYNC_POOL_SIZE)
    }
}

impl TaskScheduler {
    /// Create a scheduler with the given pool sizes.
    #[must_use]
    pub fn new(scheduled_workers: usize, async_workers: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            scheduled_permits: Arc::new(Semaphore::new(scheduled_workers.max(1))),
            async_permits: Arc::new(Semaphore::new(async_workers.max(1))),
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.schedule_owned(None, delay, task)
    }

    pub(crate) fn schedule_owned(
        &self,
        owner: Option<&str>,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TaskId {
        let id = self.next_id();
        let token = self.root.child_token();
        // The oneshot gates the body until the entry is in the table, so
        // self-removal cannot race the insert.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let permits = Arc::clone(&self.scheduled_permits);
        let tasks = Arc::clone(&self.tasks);
        let completed = Arc::clone(&self.completed);
        let task_token = token.clone();
        let handle = self.tracker.spawn(async move {
            let _ = ready_rx.await;
            tokio::select! {
                () = task_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Ok(_permit) = permits.acquire_owned().await {
                        run_guarded(task);
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            // One-shot tasks remove themselves on completion.
            tasks.remove(&id);
        });
        self.track(id, token, handle.abort_handle(), owner, false);
        let _ = ready_tx.send(());
        id
    }

    /// Run `task` at a fixed rate. Missed ticks coalesce instead of
    /// bursting.
    pub fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> TaskId {
        let id = self.next_id();
        let token = self.root.child_token();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let permits = Arc::clone(&self.scheduled_permits);
        let tasks = Arc::clone(&self.tasks);
        let completed = Arc::clone(&self.completed);
        let task_token = token.clone();
        let handle = self.tracker.spawn(async move {
            let _ = ready_rx.await;
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval =
                tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        let Ok(_permit) = permits.clone().acquire_owned().await else { break };
                        run_guarded_mut(&mut task);
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            tasks.remove(&id);
        });
        self.track(id, token, handle.abort_handle(), None, true);
        let _ = ready_tx.send(());
        id
    }

    /// Run `task` repeatedly with `delay` between the end of one run and
    /// the start of the next.
    pub fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> TaskId {
        let id = self.next_id();
        let token = self.root.child_token();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let permits = Arc::clone(&self.scheduled_permits);
        let tasks = Arc::clone(&self.tasks);
        let completed = Arc::clone(&self.completed);
        let task_token = token.clone();
        let handle = self.tracker.spawn(async move {
            let _ = ready_rx.await;
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    () = tokio::time::sleep(wait) => {
                        let Ok(_permit) = permits.clone().acquire_owned().await else { break };
                        run_guarded_mut(&mut task);
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                wait = delay;
            }
            tasks.remove(&id);
        });
        self.track(id, token, handle.abort_handle(), None, true);
        let _ = ready_tx.send(());
        id
    }

    /// Submit `task` to the async pool immediately.
    ///
    /// The returned handle yields the task's result, or `None` when the
    /// task was cancelled before running.
    pub fn run_async<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> (TaskId, AsyncHandle<T>) {
        self.run_async_owned(None, task)
    }

    pub(crate) fn run_async_owned<T: Send + 'static>(
        &self,
        owner: Option<&str>,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> (TaskId, AsyncHandle<T>) {
        let id = self.next_id();
        let token = self.root.child_token();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let permits = Arc::clone(&self.async_permits);
        let tasks = Arc::clone(&self.tasks);
        let completed = Arc::clone(&self.completed);
        let task_token = token.clone();
        let handle = self.tracker.spawn(async move {
            let _ = ready_rx.await;
            let result = tokio::select! {
                () = task_token.cancelled() => None,
                permit = permits.acquire_owned() => match permit {
                    Ok(_permit) => {
                        let value = catch_unwind(AssertUnwindSafe(task));
                        completed.fetch_add(1, Ordering::Relaxed);
                        match value {
                            Ok(value) => Some(value),
                            Err(_) => {
                                error!("async task panicked");
                                None
                            }
                        }
                    }
                    Err(_) => None,
                },
            };
            tasks.remove(&id);
            result
        });
        self.track(id, token, handle.abort_handle(), owner, false);
        let _ = ready_tx.send(());
        (id, AsyncHandle { id, handle })
    }

    /// Cooperatively cancel a task.
    ///
    /// Returns false when the task is unknown, already finished, or
    /// already cancelled; calling again is harmless.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(entry) if !entry.token.is_cancelled() => {
                entry.token.cancel();
                debug!(task = id, "task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Cancel and abort a task, interrupting in-flight work.
    pub fn cancel_now(&self, id: TaskId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, entry)) => {
                entry.token.cancel();
                entry.abort.abort();
                debug!(task = id, "task aborted");
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked task.
    pub fn cancel_all(&self) {
        let mut cancelled = 0_usize;
        for entry in self.tasks.iter() {
            entry.token.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(cancelled, "all tasks cancelled");
        }
    }

    /// Task ids currently tracked for `owner`.
    #[must_use]
    pub fn tasks_for_owner(&self, owner: &str) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(owner))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a task is repeating. `None` for unknown ids.
    #[must_use]
    pub fn is_repeating(&self, id: TaskId) -> Option<bool> {
        self.tasks.get(&id).map(|entry| entry.repeating)
    }

    /// Age of a tracked task.
    #[must_use]
    pub fn task_age(&self, id: TaskId) -> Option<Duration> {
        self.tasks.get(&id).map(|entry| entry.created_at.elapsed())
    }

    /// Scheduler counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active: self.tasks.len(),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Cancel everything and stop both pools: five seconds of grace,
    /// then force.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.scheduled_permits.close();
        self.async_permits.close();
        self.tracker.close();
        if tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("scheduler drain timed out, aborting remaining tasks");
            for entry in self.tasks.iter() {
                entry.abort.abort();
            }
        }
        self.tasks.clear();
        debug!("scheduler shut down");
    }

    fn next_id(&self) -> TaskId {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track(
        &self,
        id: TaskId,
        token: CancellationToken,
        abort: AbortHandle,
        owner: Option<&str>,
        repeating: bool,
    ) {
        self.tasks.insert(
            id,
            TaskEntry {
                token,
                abort,
                repeating,
                owner: owner.map(String::from),
                created_at: Instant::now(),
            },
        );
    }
}

/// Handle to an async task's result.
#[derive(Debug)]
pub struct AsyncHandle<T> {
    /// The task's id.
    pub id: TaskId,
    handle: tokio::task::JoinHandle<Option<T>>,
}

impl<T> AsyncHandle<T> {
    /// Await the task's result. `None` when it was cancelled, aborted,
    /// or panicked.
    pub async fn join(self) -> Option<T> {
        self.handle.await.ok().flatten()
    }
}

/// Scheduler facade that tags submissions with the owning plugin.
#[derive(Clone)]
pub struct PluginScheduler {
    inner: Arc<TaskScheduler>,
    owner: String,
}

impl std::fmt::Debug for PluginScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginScheduler")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl PluginScheduler {
    /// Create a facade for `owner`.
    #[must_use]
    pub fn new(inner: Arc<TaskScheduler>, owner: String) -> Self {
        Self { inner, owner }
    }

    /// See [`TaskScheduler::schedule`].
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.inner.schedule_owned(Some(&self.owner), delay, task)
    }

    /// See [`TaskScheduler::run_async`].
    pub fn run_async<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> (TaskId, AsyncHandle<T>) {
        self.inner.run_async_owned(Some(&self.owner), task)
    }

    /// See [`TaskScheduler::cancel`].
    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.cancel(id)
    }

    /// Ids of this plugin's tracked tasks.
    #[must_use]
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.inner.tasks_for_owner(&self.owner)
    }
}

fn run_guarded(task: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("scheduled task panicked");
    }
}

fn run_guarded_mut(task: &mut (impl FnMut() + Send)) {
    if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
        error!("scheduled task panicked");
    }
}
