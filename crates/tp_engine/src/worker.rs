//! A single-threaded task executor owning one queue (spec §4.3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tp_os::thread::SchedulingPolicy;

use crate::ring_queue::RingQueue;
use crate::task::{SettledHook, Task, TaskBody};
use crate::task_promise::{TaskPromise, TaskState};

/// Default per-worker queue capacity (spec §6).
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
/// Default idle-spin count before a worker sleeps on its condition
/// variable (spec §6).
pub const DEFAULT_MAX_IDLE_LOOP_COUNT: u64 = 0xFFFFFF;

/// Construction-time knobs for a [`Worker`] (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub(crate) max_queue_size: usize,
    pub(crate) max_idle_loop_count: u64,
    pub(crate) scheduling: (SchedulingPolicy, i32),
}

impl WorkerConfig {
    /// Per-worker queue capacity. Default [`DEFAULT_MAX_QUEUE_SIZE`].
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Idle-spin count before sleeping on the condition variable. Default
    /// [`DEFAULT_MAX_IDLE_LOOP_COUNT`].
    pub fn with_max_idle_loop_count(mut self, max_idle_loop_count: u64) -> Self {
        self.max_idle_loop_count = max_idle_loop_count;
        self
    }

    /// Scheduling policy and priority requested for the worker thread
    /// (spec §6: "optional: set thread scheduling policy ... with an
    /// integer priority"), forwarded to [`tp_os::thread::try_set_scheduling`]
    /// when the worker starts. Failures are logged, never fatal.
    pub fn with_scheduling(mut self, policy: SchedulingPolicy, priority: i32) -> Self {
        self.scheduling = (policy, priority);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_idle_loop_count: DEFAULT_MAX_IDLE_LOOP_COUNT,
            scheduling: (SchedulingPolicy::Other, 0),
        }
    }
}

/// Callback invoked from a worker's own thread whenever its `pop` finds
/// the queue empty (spec §4.3, the work-stealing seam).
pub type IdleCallback = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// A dedicated OS thread with its own bounded task queue (spec §3, §4.3).
///
/// A `Worker` is always constructed with a concrete id and configuration —
/// unlike the original, which allows an uninitialized `workerId = -1`
/// between construction and `init`, the Rust encoding folds construction
/// and initialization into [`Worker::new`] since [`Pool`](crate::Pool)
/// always performs both together.
pub struct Worker {
    id: u32,
    queue: RingQueue<Task>,
    exit_flag: AtomicBool,
    drain_flag: AtomicBool,
    started: AtomicBool,
    running: AtomicBool,
    idle_count: AtomicU64,
    max_idle_loop_count: u64,
    scheduling: (SchedulingPolicy, i32),
    sleep_lock: Mutex<()>,
    sleep_cvar: Condvar,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Constructs and initializes a worker with the given id and config.
    /// The worker does not start executing until [`Worker::start`] is
    /// called.
    pub fn new(id: u32, config: WorkerConfig) -> Worker {
        Worker {
            id,
            queue: RingQueue::new(config.max_queue_size),
            exit_flag: AtomicBool::new(false),
            drain_flag: AtomicBool::new(false),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            idle_count: AtomicU64::new(0),
            max_idle_loop_count: config.max_idle_loop_count,
            scheduling: config.scheduling,
            sleep_lock: Mutex::new(()),
            sleep_cvar: Condvar::new(),
            join_handle: Mutex::new(None),
        }
    }

    /// This worker's id, assigned at construction.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// `true` once [`Worker::start`] has spawned the thread and it has not
    /// yet returned.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `true` if this worker was started and its thread has since returned
    /// — i.e. a post to it would enqueue behind a consumer that will never
    /// come back. `false` both before the first `start()` (tasks posted
    /// then simply wait for it) and while running.
    ///
    /// This is the predicate behind the drain-then-exit FIXME (spec §9):
    /// "retried tasks may be placed on a worker that has already exited
    /// during `stopAndWaitAll`, causing the task to remain unexecuted."
    /// [`Pool`](crate::Pool) uses it to fall back to a still-running worker
    /// instead.
    pub fn has_exited(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.running.load(Ordering::Acquire)
    }

    /// `true` if a join handle is still held (the thread has not been
    /// joined via [`Worker::wait_for_exit`]).
    pub fn is_joinable(&self) -> bool {
        self.join_handle.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// A best-effort snapshot of how many tasks are queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The idle-spin threshold configured for this worker (spec §4.4.3
    /// divides this by 1000 for the work-stealing trigger).
    pub fn max_idle_loop_count(&self) -> u64 {
        self.max_idle_loop_count
    }

    /// This worker's fixed queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// `true` if the queue has spare capacity (spec §4.4.2: "a non-full
    /// worker is one with `queue.size() < queue.capacity()`").
    pub fn has_capacity(&self) -> bool {
        !self.queue.is_full()
    }

    /// A best-effort snapshot of the consecutive empty-pop count.
    pub fn idle_count(&self) -> u64 {
        self.idle_count.load(Ordering::Acquire)
    }

    /// Spawns the OS thread that runs this worker's main loop (spec
    /// §4.3). `idle_callback`, if present, is invoked from the worker's
    /// own thread every time its queue is found empty — this is the
    /// work-stealing seam the pool uses when stealing is enabled.
    pub fn start(self: &Arc<Self>, idle_callback: Option<IdleCallback>) -> std::io::Result<()> {
        self.started.store(true, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let worker = Arc::clone(self);
        let handle = tp_os::thread::spawn_named(format!("Worker-{}", self.id), move || {
            let (policy, priority) = worker.scheduling;
            if let Err(err) = tp_os::thread::try_set_scheduling(policy, priority) {
                log::warn!("worker {}: failed to apply scheduling policy: {err}", worker.id);
            }
            worker.run(idle_callback);
        })?;

        *self.join_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Requests shutdown. `drain = true` waits until the queue empties
    /// before exiting; `drain = false` exits at the next loop iteration,
    /// cancelling whatever remains queued.
    pub fn exit(&self, drain: bool) {
        if drain {
            self.drain_flag.store(true, Ordering::Release);
        } else {
            self.exit_flag.store(true, Ordering::Release);
        }
        self.wake();
    }

    /// Joins the worker thread. A no-op if already joined.
    pub fn wait_for_exit(&self) {
        let handle = self.join_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Allocates a fresh promise, records this worker in its trail, and
    /// enqueues `body`. Returns `None` on queue-full (spec §4.3).
    pub fn post(self: &Arc<Self>, body: TaskBody) -> Option<TaskPromise> {
        let promise = TaskPromise::new(0);
        if self.post_existing(body, &promise) {
            Some(promise)
        } else {
            None
        }
    }

    /// Same as [`Worker::post`] but reuses `promise`, preserving identity
    /// for retries and dependents. On failure the worker-trail append is
    /// rolled back (spec §4.3).
    pub fn post_existing(self: &Arc<Self>, body: TaskBody, promise: &TaskPromise) -> bool {
        promise.push_trail(self.id);
        let task = Task::new(body, promise.clone());

        match self.queue.push(task) {
            Ok(()) => {
                self.wake();
                true
            }
            Err(_task) => {
                promise.rollback_trail();
                false
            }
        }
    }

    /// Same as [`Worker::post_existing`], but `hook` runs after this
    /// invocation has attempted `promise.done()` and is otherwise finished
    /// with the task — used by [`Pool`](crate::Pool) so a retry triggered
    /// from the hook can never race the original invocation's own
    /// `done()` attempt.
    pub(crate) fn post_existing_with_hook(
        self: &Arc<Self>,
        body: TaskBody,
        promise: &TaskPromise,
        hook: SettledHook,
    ) -> bool {
        promise.push_trail(self.id);
        let task = Task::with_settled_hook(body, promise.clone(), hook);

        match self.queue.push(task) {
            Ok(()) => {
                self.wake();
                true
            }
            Err(_task) => {
                promise.rollback_trail();
                false
            }
        }
    }

    /// Pushes a task directly (used by the pool's work-stealing path,
    /// which already holds a constructed [`Task`] popped from another
    /// worker's queue). Appends this worker to the task's promise trail
    /// before pushing, rolling back on failure — the same
    /// push-or-roll-back contract `post_existing` follows — so
    /// `last_worker_id()` (set by the destination worker's own `execute`)
    /// stays consistent with `worker_trail().last()` per spec §8, even
    /// though the task was never posted to this worker through
    /// `post_existing`.
    pub(crate) fn push_stolen(&self, task: Task) -> Result<(), Task> {
        task.promise.push_trail(self.id);
        match self.queue.push(task) {
            Ok(()) => {
                self.wake();
                Ok(())
            }
            Err(task) => {
                task.promise.rollback_trail();
                Err(task)
            }
        }
    }

    /// Pops a task from this worker's own queue for stealing by another
    /// worker (spec §4.4.3). Never called from this worker's own thread.
    pub(crate) fn steal_one(&self) -> Option<Task> {
        self.queue.pop()
    }

    fn wake(&self) {
        let _guard = self.sleep_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.sleep_cvar.notify_all();
    }

    fn run(&self, idle_callback: Option<IdleCallback>) {
        loop {
            if self.exit_flag.load(Ordering::Acquire) {
                break;
            }

            match self.queue.pop() {
                Some(task) => {
                    self.idle_count.store(0, Ordering::Release);
                    self.execute(task);
                }
                None => {
                    let idle = self.idle_count.fetch_add(1, Ordering::AcqRel) + 1;

                    if let Some(callback) = &idle_callback {
                        callback(self.id, idle);
                    }

                    if self.drain_flag.load(Ordering::Acquire) && self.queue.is_empty() {
                        self.exit_flag.store(true, Ordering::Release);
                        break;
                    }

                    if idle > self.max_idle_loop_count {
                        self.sleep_until_woken();
                        self.idle_count.store(0, Ordering::Release);
                    }
                }
            }
        }

        self.drain_on_shutdown();
        self.running.store(false, Ordering::Release);
    }

    fn execute(&self, task: Task) {
        let Task { body, promise, on_settled } = task;

        if promise.change_state(TaskState::QUEUING, TaskState::RUNNING) {
            promise.set_last_worker_id(self.id);
            body();
            // Must run before `on_settled`: a retry hook that resubmits
            // the promise elsewhere must not start until this invocation
            // has released it, or a later invocation's Running state
            // could satisfy this CAS instead of its own.
            promise.done();
            if let Some(hook) = on_settled {
                hook(promise.state());
            }
        }
        // else: cancelled before pickup, drop the body without running it.
    }

    fn sleep_until_woken(&self) {
        let guard = self.sleep_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .sleep_cvar
            .wait_while(guard, |_| {
                self.queue.is_empty()
                    && !self.exit_flag.load(Ordering::Acquire)
                    && !self.drain_flag.load(Ordering::Acquire)
            })
            .unwrap_or_else(|e| e.into_inner());
    }

    fn drain_on_shutdown(&self) {
        while let Some(task) = self.queue.pop() {
            task.promise.set_last_worker_id(self.id);
            task.promise.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn spawn_worker(id: u32) -> Arc<Worker> {
        let worker = Arc::new(Worker::new(id, WorkerConfig::default().with_max_idle_loop_count(4)));
        worker.start(None).unwrap();
        worker
    }

    #[test]
    fn post_and_execute() {
        let worker = spawn_worker(0);
        let ran = Arc::new(AtomicBool::new(false));

        let promise = {
            let ran = ran.clone();
            worker.post(Box::new(move || ran.store(true, Ordering::SeqCst))).unwrap()
        };

        assert_eq!(promise.wait(), TaskState::DONE);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(promise.last_worker_id(), Some(0));
        assert_eq!(promise.worker_trail(), vec![0]);

        worker.exit(false);
        worker.wait_for_exit();
    }

    #[test]
    fn cancelled_before_pickup_never_runs() {
        let worker = spawn_worker(1);
        let ran = Arc::new(AtomicBool::new(false));

        let promise = TaskPromise::new(0);
        assert!(promise.cancel());

        let ok = {
            let ran = ran.clone();
            worker.post_existing(Box::new(move || ran.store(true, Ordering::SeqCst)), &promise)
        };
        assert!(ok);

        worker.exit(true);
        worker.wait_for_exit();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(promise.state(), TaskState::CANCELLED);
    }

    #[test]
    fn queue_full_rolls_back_trail() {
        let worker = Arc::new(Worker::new(2, WorkerConfig::default().with_max_queue_size(1)));
        // Don't start the thread, so the queue never drains.
        let promise = TaskPromise::new(0);
        assert!(worker.post_existing(Box::new(|| {}), &promise));
        assert!(!worker.post_existing(Box::new(|| {}), &promise));
        assert_eq!(promise.worker_trail(), vec![2]);
    }

    #[test]
    fn push_stolen_appends_destination_to_trail() {
        let source = Arc::new(Worker::new(5, WorkerConfig::default()));
        let promise = TaskPromise::new(0);
        assert!(source.post_existing(Box::new(|| {}), &promise));
        assert_eq!(promise.worker_trail(), vec![5]);

        let task = source.steal_one().expect("task was just posted");
        let destination = Arc::new(Worker::new(6, WorkerConfig::default()));
        assert!(destination.push_stolen(task).is_ok());

        // The destination worker is appended, so `worker_trail().last()`
        // matches whichever worker eventually runs (and sets
        // `last_worker_id` on) the task — spec §8's trail invariant still
        // holds once a task crosses queues via stealing.
        assert_eq!(promise.worker_trail(), vec![5, 6]);
    }

    #[test]
    fn push_stolen_rolls_back_trail_on_queue_full() {
        let destination = Arc::new(Worker::new(7, WorkerConfig::default().with_max_queue_size(1)));
        // Fill the destination so the stolen push fails.
        let filler = TaskPromise::new(0);
        assert!(destination.post_existing(Box::new(|| {}), &filler));

        let promise = TaskPromise::new(0);
        promise.push_trail(9);
        let task = Task::new(Box::new(|| {}), promise.clone());

        let err = destination.push_stolen(task);
        assert!(err.is_err());
        assert_eq!(promise.worker_trail(), vec![9]);
    }

    #[test]
    fn drain_then_exit_finishes_queued_work() {
        let worker = spawn_worker(3);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut promises = Vec::new();
        for _ in 0..20 {
            let counter = counter.clone();
            promises.push(worker.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })).unwrap());
        }

        worker.exit(true);
        worker.wait_for_exit();

        for p in &promises {
            assert!(matches!(p.state(), TaskState::DONE | TaskState::CANCELLED));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn immediate_exit_cancels_remaining_queue() {
        let worker = Arc::new(Worker::new(4, WorkerConfig::default().with_max_queue_size(8)));
        let mut promises = Vec::new();
        for _ in 0..8 {
            promises.push(worker.post(Box::new(|| {
                std::thread::sleep(Duration::from_millis(50));
            })).unwrap());
        }

        worker.start(None).unwrap();
        worker.exit(false);
        worker.wait_for_exit();

        let cancelled = promises.iter().filter(|p| p.state() == TaskState::CANCELLED).count();
        assert!(cancelled > 0);
    }
}
