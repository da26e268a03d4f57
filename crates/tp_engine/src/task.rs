//! Submission-time configuration and the internal queued unit (spec §3).

use crate::task_promise::{TaskPromise, TaskState};

/// Placement priority for a submission (spec §4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Biased toward the most-idle worker.
    High,
    /// Uniform-random placement, round-robin fallback.
    #[default]
    Normal,
    /// Biased toward the busiest worker (keeps idle workers free for
    /// latency-sensitive `High` work).
    Low,
}

/// The callable enqueued into a worker, boxed so workers can hold a
/// homogeneous queue of heterogeneous task bodies.
pub type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// Submission-time configuration (spec §3).
///
/// Construct with [`TaskDescription::new`] and the builder setters, or
/// `TaskDescription::default()` for an immediate, unprioritized,
/// dependency-free submission.
pub struct TaskDescription {
    pub(crate) name: Option<String>,
    pub(crate) specify_worker_id: Option<u32>,
    pub(crate) dependencies: Vec<TaskPromise>,
    pub(crate) reuse_promise: Option<TaskPromise>,
    pub(crate) priority: Priority,
    pub(crate) retry_count: u32,
    pub(crate) user_data: usize,
}

impl TaskDescription {
    /// A default description: no name, any worker, no dependencies,
    /// `Normal` priority, retry count 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a diagnostic name, used only in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pins the submission to a specific worker id.
    pub fn with_worker_id(mut self, worker_id: u32) -> Self {
        self.specify_worker_id = Some(worker_id);
        self
    }

    /// Adds dependencies that must all be `Done` before the body runs.
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskPromise>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Sets the placement priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Opaque caller-supplied data attached to the `TaskPromise` allocated
    /// for this submission (spec §6). Only takes effect when a fresh
    /// promise is allocated; ignored if this description is later routed
    /// through a reused promise (a retry's `userData` was already fixed
    /// when that promise was first allocated).
    pub fn with_user_data(mut self, user_data: usize) -> Self {
        self.user_data = user_data;
        self
    }

    pub(crate) fn reuse_promise(mut self, promise: TaskPromise) -> Self {
        self.reuse_promise = Some(promise);
        self
    }

    pub(crate) fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

impl Default for TaskDescription {
    fn default() -> Self {
        TaskDescription {
            name: None,
            specify_worker_id: None,
            dependencies: Vec::new(),
            reuse_promise: None,
            priority: Priority::default(),
            retry_count: 0,
            user_data: 0,
        }
    }
}

/// Runs once a worker has attempted the `Running` → `Done` transition for a
/// task, with the resulting state, after the worker has otherwise finished
/// with it (spec §4.4.1 step 3's completion hook). [`Pool`](crate::Pool)
/// uses this to log completion or, for an unmet dependency, to re-enter
/// submission only once the original invocation has released the promise.
pub(crate) type SettledHook = Box<dyn FnOnce(TaskState) + Send>;

/// The unit enqueued into a worker's [`RingQueue`](crate::RingQueue): a
/// boxed callable paired with the promise it drives (spec §3).
pub struct Task {
    pub(crate) body: TaskBody,
    pub(crate) promise: TaskPromise,
    pub(crate) on_settled: Option<SettledHook>,
}

impl Task {
    pub(crate) fn new(body: TaskBody, promise: TaskPromise) -> Self {
        Task { body, promise, on_settled: None }
    }

    pub(crate) fn with_settled_hook(body: TaskBody, promise: TaskPromise, hook: SettledHook) -> Self {
        Task { body, promise, on_settled: Some(hook) }
    }
}
