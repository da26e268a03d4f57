//! Task identity and the per-task state machine (spec §3, §4.2).

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A task's lifecycle state.
///
/// This is a newtype over `u32` rather than a closed Rust `enum` because
/// the state space is extensible: values at or above [`TaskState::CUSTOM`]
/// are reserved for callers (and, here, the pool itself) to define
/// additional terminal-or-transient states without touching this type.
///
/// # Examples
///
/// A caller wanting to distinguish "body ran but reported failure" from
/// `Done` (the original implementation's `Failed` state, deliberately not
/// built in here — see spec §4) can allocate its own constant above the
/// custom sentinel:
///
/// ```
/// use tp_engine::TaskState;
///
/// const FAILED: TaskState = TaskState::custom(1);
/// assert!(FAILED.is_custom());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskState(u32);

impl TaskState {
    /// Queued, not yet picked up by a worker.
    pub const QUEUING: TaskState = TaskState(0);
    /// Picked up by a worker; the body is executing (or about to).
    pub const RUNNING: TaskState = TaskState(1);
    /// The body returned normally.
    pub const DONE: TaskState = TaskState(2);
    /// Cancelled before execution began.
    pub const CANCELLED: TaskState = TaskState(3);

    /// Reserved sentinel: values at or above this are caller-defined.
    pub const CUSTOM: u32 = 0x8000;

    /// Constructs a custom state `CUSTOM + offset`.
    pub const fn custom(offset: u32) -> TaskState {
        TaskState(Self::CUSTOM + offset)
    }

    /// `true` if this is a caller-defined state at or above [`Self::CUSTOM`].
    pub const fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOM
    }

    const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::QUEUING => write!(f, "Queuing"),
            Self::RUNNING => write!(f, "Running"),
            Self::DONE => write!(f, "Done"),
            Self::CANCELLED => write!(f, "Cancelled"),
            other if other.is_custom() => write!(f, "Custom({})", other.0 - Self::CUSTOM),
            other => write!(f, "TaskState({})", other.0),
        }
    }
}

/// The pool's own custom state: dependencies unmet, schedule a retry
/// (spec §3, §9: "this spec prescribes Running→DependsUnfinished").
pub(crate) const DEPENDS_UNFINISHED: TaskState = TaskState::custom(0);

/// Sentinel `lastWorkerId` meaning "never assigned to a worker".
pub(crate) const NO_WORKER: i64 = -1;

/// A shared, independently-addressable handle to one task's state machine
/// (spec §3, §4.2).
///
/// Cloning a `TaskPromise` clones the handle, not the task: all clones
/// observe the same atomic state and worker trail. The promise outlives
/// the task itself if any handle is still held after the task terminates.
#[derive(Clone)]
pub struct TaskPromise {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU32,
    last_worker_id: AtomicI64,
    worker_trail: Mutex<Vec<u32>>,
    task_id: AtomicU64,
    user_data: usize,
    wait_lock: Mutex<()>,
    wait_cvar: Condvar,
}

impl TaskPromise {
    /// Creates a new promise in [`TaskState::QUEUING`] with `task_id` 0 and
    /// no worker trail; `Pool::submit` assigns the final `task_id`.
    pub fn new(user_data: usize) -> TaskPromise {
        TaskPromise {
            inner: Arc::new(Inner {
                state: AtomicU32::new(TaskState::QUEUING.raw()),
                last_worker_id: AtomicI64::new(NO_WORKER),
                worker_trail: Mutex::new(Vec::new()),
                task_id: AtomicU64::new(0),
                user_data,
                wait_lock: Mutex::new(()),
                wait_cvar: Condvar::new(),
            }),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> TaskState {
        TaskState(self.inner.state.load(Ordering::Acquire))
    }

    /// The id of the worker that most recently picked up (or cancelled)
    /// this task, or `None` if it was never assigned one.
    pub fn last_worker_id(&self) -> Option<u32> {
        match self.inner.last_worker_id.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(id as u32),
        }
    }

    /// The ordered list of worker ids this task was ever posted to.
    pub fn worker_trail(&self) -> Vec<u32> {
        self.inner.worker_trail.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Monotonic id assigned by the pool at submission.
    pub fn task_id(&self) -> u64 {
        self.inner.task_id.load(Ordering::Acquire)
    }

    /// Opaque caller-supplied data.
    pub fn user_data(&self) -> usize {
        self.inner.user_data
    }

    pub(crate) fn set_task_id(&self, id: u64) {
        self.inner.task_id.store(id, Ordering::Release);
    }

    pub(crate) fn set_last_worker_id(&self, worker_id: u32) {
        self.inner.last_worker_id.store(worker_id as i64, Ordering::Release);
    }

    /// Appends `worker_id` to the trail. Pair with [`Self::rollback_trail`]
    /// on a failed post (spec §4.3: "On failure, the worker-trail append
    /// is rolled back").
    pub(crate) fn push_trail(&self, worker_id: u32) {
        self.inner.worker_trail.lock().unwrap_or_else(|e| e.into_inner()).push(worker_id);
    }

    pub(crate) fn rollback_trail(&self) {
        self.inner.worker_trail.lock().unwrap_or_else(|e| e.into_inner()).pop();
    }

    /// CAS `Queuing` → `Cancelled`. Returns `true` on success; `false` if
    /// the task is running, done, or already cancelled.
    pub fn cancel(&self) -> bool {
        let ok = self.cas(TaskState::QUEUING, TaskState::CANCELLED);
        if ok {
            self.notify_all();
        }
        ok
    }

    /// CAS that only succeeds if the current state equals `expected`.
    pub fn change_state(&self, expected: TaskState, new: TaskState) -> bool {
        let ok = self.cas(expected, new);
        if ok {
            self.notify_all();
        }
        ok
    }

    /// CAS any non-`Queuing`/`Running` state → `Queuing`. Used when
    /// re-submitting after a dependency retry.
    pub fn reset_state(&self) -> bool {
        let current = self.state();
        if current == TaskState::QUEUING || current == TaskState::RUNNING {
            return false;
        }
        self.cas(current, TaskState::QUEUING)
    }

    /// CAS `Running` → `Done`; notifies waiters.
    pub fn done(&self) -> bool {
        let ok = self.cas(TaskState::RUNNING, TaskState::DONE);
        if ok {
            self.notify_all();
        }
        ok
    }

    /// Blocks the caller until the state is neither `Queuing` nor
    /// `Running`, then returns it.
    pub fn wait(&self) -> TaskState {
        let mut state = self.state();
        if !matches!(state, TaskState::QUEUING | TaskState::RUNNING) {
            return state;
        }

        let guard = self.inner.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .inner
            .wait_cvar
            .wait_while(guard, |_| {
                state = self.state();
                matches!(state, TaskState::QUEUING | TaskState::RUNNING)
            })
            .unwrap_or_else(|e| e.into_inner());
        state
    }

    fn cas(&self, expected: TaskState, new: TaskState) -> bool {
        self.inner
            .state
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn notify_all(&self) {
        let _guard = self.inner.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.wait_cvar.notify_all();
    }
}

impl fmt::Debug for TaskPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPromise")
            .field("task_id", &self.task_id())
            .field("state", &self.state())
            .field("last_worker_id", &self.last_worker_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn cancel_succeeds_only_from_queuing() {
        let p = TaskPromise::new(0);
        assert!(p.cancel());
        assert_eq!(p.state(), TaskState::CANCELLED);
        // idempotent cancel: second call fails.
        assert!(!p.cancel());
    }

    #[test]
    fn cancel_fails_once_running() {
        let p = TaskPromise::new(0);
        assert!(p.change_state(TaskState::QUEUING, TaskState::RUNNING));
        assert!(!p.cancel());
        assert_eq!(p.state(), TaskState::RUNNING);
    }

    #[test]
    fn done_requires_running() {
        let p = TaskPromise::new(0);
        assert!(!p.done());
        assert!(p.change_state(TaskState::QUEUING, TaskState::RUNNING));
        assert!(p.done());
        assert_eq!(p.state(), TaskState::DONE);
    }

    #[test]
    fn reset_state_from_terminal_only() {
        let p = TaskPromise::new(0);
        assert!(!p.reset_state(), "Queuing is not a valid reset source");
        p.change_state(TaskState::QUEUING, TaskState::RUNNING);
        assert!(!p.reset_state(), "Running is not a valid reset source");
        p.done();
        assert!(p.reset_state());
        assert_eq!(p.state(), TaskState::QUEUING);
    }

    #[test]
    fn wait_blocks_until_terminal() {
        let p = TaskPromise::new(0);
        p.change_state(TaskState::QUEUING, TaskState::RUNNING);

        let waiter = {
            let p = p.clone();
            thread::spawn(move || p.wait())
        };

        thread::sleep(std::time::Duration::from_millis(20));
        p.done();

        assert_eq!(waiter.join().unwrap(), TaskState::DONE);
    }

    #[test]
    fn execution_uniqueness_under_race() {
        use std::sync::atomic::AtomicUsize;

        let p = TaskPromise::new(0);
        let wins = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if p.change_state(TaskState::QUEUING, TaskState::RUNNING) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_trail_rollback() {
        let p = TaskPromise::new(0);
        p.push_trail(3);
        p.push_trail(4);
        p.rollback_trail();
        assert_eq!(p.worker_trail(), vec![3]);
    }
}
