//! The dispatcher: placement policy, dependency retry, work stealing
//! (spec §4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::SubmitError;
use crate::task::{Priority, SettledHook, Task, TaskBody, TaskDescription};
use crate::task_promise::{TaskPromise, TaskState, DEPENDS_UNFINISHED};
use crate::worker::{IdleCallback, Worker, WorkerConfig};
use crate::xor_shift::XorShift64Star;

/// Construction-time knobs for a [`Pool`].
pub struct PoolBuilder {
    num_threads: usize,
    worker_config: WorkerConfig,
}

impl PoolBuilder {
    /// Starts a builder for a pool of `num_threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads == 0` (spec §4.4: "Construction takes
    /// `numThreads ≥ 1`").
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads >= 1, "a pool needs at least one worker");
        PoolBuilder { num_threads, worker_config: WorkerConfig::default() }
    }

    /// Configuration applied to every worker in the pool.
    pub fn with_worker_config(mut self, worker_config: WorkerConfig) -> Self {
        self.worker_config = worker_config;
        self
    }

    /// Creates and initializes all workers, but does not start them — call
    /// [`Pool::start`] to spawn their threads.
    pub fn build(self) -> Arc<Pool> {
        let workers = (0..self.num_threads as u32).map(|id| Arc::new(Worker::new(id, self.worker_config))).collect();

        Arc::new(Pool {
            workers,
            next_task_id: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
            stealing_enabled: AtomicBool::new(false),
            rng: XorShift64Star::new(),
            completion_lock: Mutex::new(()),
            completion_cvar: Condvar::new(),
        })
    }
}

/// Owns a fixed vector of [`Worker`]s and dispatches submissions to them
/// (spec §2, §4.4).
pub struct Pool {
    workers: Vec<Arc<Worker>>,
    next_task_id: AtomicU64,
    round_robin: AtomicUsize,
    stealing_enabled: AtomicBool,
    rng: XorShift64Star,
    completion_lock: Mutex<()>,
    completion_cvar: Condvar,
}

/// Data the completion hook needs to re-enter submission on retry; carried
/// alongside the not-yet-invoked user body while a task is blocked on an
/// unmet dependency.
struct PendingRetry {
    promise: TaskPromise,
    name: Option<String>,
    specify_worker_id: Option<u32>,
    dependencies: Vec<TaskPromise>,
    priority: Priority,
    retry_count: u32,
}

impl Pool {
    /// Creates and initializes a pool of `num_threads` workers with default
    /// configuration. Equivalent to `PoolBuilder::new(num_threads).build()`.
    pub fn new(num_threads: usize) -> Arc<Pool> {
        PoolBuilder::new(num_threads).build()
    }

    /// The number of workers in this pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Registers the work-stealing idle callback (iff `enable_work_stealing`)
    /// and starts every worker's thread (spec §4.4).
    pub fn start(self: &Arc<Self>, enable_work_stealing: bool) -> std::io::Result<()> {
        self.stealing_enabled.store(enable_work_stealing, Ordering::Release);

        for worker in &self.workers {
            let idle_callback: Option<IdleCallback> = if enable_work_stealing {
                let pool = Arc::clone(self);
                Some(Arc::new(move |worker_id, idle_count| pool.on_worker_idle(worker_id, idle_count)))
            } else {
                None
            };
            worker.start(idle_callback)?;
        }

        Ok(())
    }

    /// Requests immediate exit from all workers and joins them. Queued
    /// tasks are cancelled, not executed.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.exit(false);
        }
        for worker in &self.workers {
            worker.wait_for_exit();
        }
    }

    /// Requests drain-then-exit from all workers and joins them. Tasks
    /// blocked on an unmet dependency retry forever unless that dependency
    /// resolves — a known limitation (spec §4.5, §9).
    pub fn stop_and_wait_all(&self) {
        for worker in &self.workers {
            worker.exit(true);
        }
        for worker in &self.workers {
            worker.wait_for_exit();
        }
    }

    /// Blocks until `promise`'s state is not one of
    /// `{Queuing, Running, DependsUnfinished}` (spec §4.4.4).
    ///
    /// Backed by a pool-owned condition variable notified by the
    /// completion hook on every descriptor release, including the
    /// intermediate `DependsUnfinished` ones, so this does not spin while
    /// a dependency retry is in flight.
    pub fn wait(&self, promise: &TaskPromise) -> TaskState {
        loop {
            let guard = self.completion_lock.lock().unwrap_or_else(|e| e.into_inner());

            let state = promise.state();
            if !is_pending(state) {
                return state;
            }

            // Re-check under the lock before sleeping: a completion
            // notification delivered between the load above and this wait
            // would otherwise be lost.
            match self.completion_cvar.wait_timeout(guard, Duration::from_millis(50)) {
                Ok((_guard, _)) => {}
                Err(poisoned) => drop(poisoned.into_inner().0),
            }
        }
    }

    /// The public entry point (spec §4.4.1).
    pub fn submit(self: &Arc<Self>, body: TaskBody, desc: TaskDescription) -> Option<TaskPromise> {
        self.submit_impl(body, desc)
    }

    fn submit_impl(self: &Arc<Self>, body: TaskBody, mut desc: TaskDescription) -> Option<TaskPromise> {
        if self.workers.is_empty() {
            log::warn!("{}", SubmitError::NoWorkers);
            return None;
        }

        let promise = desc.reuse_promise.take().unwrap_or_else(|| TaskPromise::new(desc.user_data));
        let first_submission = desc.retry_count == 0 && promise.task_id() == 0;

        if desc.dependencies.iter().any(|d| d.state() == TaskState::CANCELLED) {
            log::warn!("submit '{}' rejected: {}", desc.name(), SubmitError::DependencyCancelled);
            promise.cancel();
            self.notify_completion();
            return Some(promise);
        }

        let worker_id = self.resolve_worker_id(&desc)?;
        let worker_id = match self.avoid_exited_worker(worker_id) {
            Some(id) => id,
            None => {
                // Every worker able to take this task has already exited
                // (spec §9 FIXME: "retried tasks may be placed on a worker
                // that has already exited during stopAndWaitAll"). No
                // still-running fallback exists, so cancel rather than
                // enqueue behind a consumer that will never return.
                log::warn!("submit '{}' rejected: target worker has exited and no fallback is running", desc.name());
                promise.cancel();
                self.notify_completion();
                return Some(promise);
            }
        };

        let (wrapped_body, settled_hook) = self.wrap_body(body, desc, promise.clone());

        let worker = Arc::clone(&self.workers[worker_id as usize]);
        if !worker.post_existing_with_hook(wrapped_body, &promise, settled_hook) {
            log::warn!("submission to worker {worker_id} rejected: {}", SubmitError::QueueFull);
            return None;
        }

        if first_submission {
            promise.set_task_id(self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1);
        }

        Some(promise)
    }

    /// Wraps `body` into the dependency-checking body plus its settled
    /// hook (spec §4.4.1 steps 2-3): before the user body runs, every
    /// dependency must be `Done`, or the task transitions to
    /// `DependsUnfinished` without running it; the worker then attempts
    /// `promise.done()` and only afterward runs the returned hook, which
    /// logs completion or re-enters submission for a retry. Splitting the
    /// two means a retry's resubmission never happens before the original
    /// invocation has released the promise (see `Worker::execute`).
    fn wrap_body(
        self: &Arc<Self>,
        user_body: TaskBody,
        desc: TaskDescription,
        promise: TaskPromise,
    ) -> (TaskBody, SettledHook) {
        let pool = Arc::clone(self);
        let TaskDescription { name, specify_worker_id, dependencies, priority, retry_count, .. } = desc;

        let body_slot = Arc::new(Mutex::new(Some(user_body)));
        let hook_slot = Arc::clone(&body_slot);
        let deps_for_body = dependencies.clone();
        let promise_for_body = promise.clone();

        let body: TaskBody = Box::new(move || {
            let deps_met = deps_for_body.iter().all(|d| d.state() == TaskState::DONE);

            if deps_met {
                let user_body =
                    body_slot.lock().unwrap_or_else(|e| e.into_inner()).take().expect("task body already taken");
                user_body();
            } else {
                promise_for_body.change_state(TaskState::RUNNING, DEPENDS_UNFINISHED);
            }
        });

        let hook: SettledHook = Box::new(move |final_state| {
            if final_state == TaskState::DONE {
                pool.on_done(name);
            } else if final_state == DEPENDS_UNFINISHED {
                let user_body =
                    hook_slot.lock().unwrap_or_else(|e| e.into_inner()).take().expect("task body already taken");
                pool.on_depends_unfinished(
                    user_body,
                    PendingRetry { promise, name, specify_worker_id, dependencies, priority, retry_count },
                );
            } else {
                pool.notify_completion();
            }
        });

        (body, hook)
    }

    /// The completion hook's "success" branch: the descriptor's single use
    /// is over, log and wake waiters.
    fn on_done(&self, name: Option<String>) {
        log::debug!("task '{}' completed", name.as_deref().unwrap_or("<unnamed>"));
        self.notify_completion();
    }

    /// The completion hook's retry branch: reset the promise to `Queuing`
    /// and re-enter submission with the same (not-yet-invoked) body and an
    /// incremented retry count.
    fn on_depends_unfinished(self: &Arc<Self>, user_body: TaskBody, pending: PendingRetry) {
        let PendingRetry { promise, name, specify_worker_id, dependencies, priority, retry_count } = pending;

        if !promise.reset_state() {
            // Cancelled out from under us between the DependsUnfinished
            // transition above and this retry attempt.
            self.notify_completion();
            return;
        }
        self.notify_completion();

        let mut desc = TaskDescription::new().with_priority(priority).with_dependencies(dependencies);
        if let Some(name) = name {
            desc = desc.with_name(name);
        }
        if let Some(worker_id) = specify_worker_id {
            desc = desc.with_worker_id(worker_id);
        }
        desc.retry_count = retry_count + 1;
        let desc = desc.reuse_promise(promise);

        self.submit_impl(user_body, desc);
    }

    fn notify_completion(&self) {
        let _guard = self.completion_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.completion_cvar.notify_all();
    }

    /// Option (b) of the drain-then-exit FIXME (spec §9): if the placement
    /// policy's pick has already exited (a worker that finished its
    /// `stopAndWaitAll` drain between pick and post), fall back to any
    /// still-running worker — preferring one with spare queue capacity —
    /// instead of posting into a queue nothing will ever drain. Returns
    /// `None` only when every worker in the pool has exited.
    fn avoid_exited_worker(&self, worker_id: u32) -> Option<u32> {
        let target = &self.workers[worker_id as usize];
        if !target.has_exited() {
            return Some(worker_id);
        }

        self.workers
            .iter()
            .filter(|w| !w.has_exited())
            .max_by_key(|w| w.has_capacity())
            .map(|w| w.id())
    }

    // -------------------------------------------------------------------
    // Placement policy (spec §4.4.2)

    fn resolve_worker_id(&self, desc: &TaskDescription) -> Option<u32> {
        if let Some(id) = desc.specify_worker_id {
            if (id as usize) < self.workers.len() {
                return Some(id);
            }
            log::error!("submit '{}' rejected: {}", desc.name(), SubmitError::InvalidWorkerId(id));
            return None;
        }

        let mut picked = match desc.priority {
            Priority::Low => self.pick_low(),
            Priority::Normal => self.pick_normal(),
            Priority::High => self.pick_high(),
        };

        if desc.retry_count > 10 {
            if let Some(locality) = self.locality_override(desc) {
                picked = Some(locality);
            }
        }

        if picked.is_none() {
            log::warn!("submit '{}' rejected: {}", desc.name(), SubmitError::QueueFull);
        }

        picked
    }

    /// Retry-locality override: bias toward the last worker an unfinished
    /// dependency ran on, to break livelock where a retry keeps re-queuing
    /// behind a dependency pending elsewhere (spec §4.4.2).
    fn locality_override(&self, desc: &TaskDescription) -> Option<u32> {
        desc.dependencies.iter().filter(|d| d.state() != TaskState::DONE).find_map(|d| d.last_worker_id())
    }

    fn non_full_workers(&self) -> Vec<&Arc<Worker>> {
        self.workers.iter().filter(|w| w.has_capacity()).collect()
    }

    /// Sorts non-full workers by `key_fn` ascending, ties always broken
    /// toward the smaller worker id, and returns the id at position `idx`
    /// (negative counts from the end). `None` when no candidate exists.
    ///
    /// Picking from the front (`idx >= 0`) needs the tie order ascending
    /// by id so the smaller id sorts first; picking from the back
    /// (`idx < 0`, e.g. "the most idle worker" — spec §4.4.2 High) needs
    /// it reversed so the smaller id still ends up last, i.e. the one
    /// extracted (otherwise the largest id among the tied candidates would
    /// be picked instead).
    fn pick_by<K: Ord>(&self, key_fn: impl Fn(&Worker) -> K, idx: isize) -> Option<u32> {
        let mut candidates = self.non_full_workers();
        if candidates.is_empty() {
            return None;
        }

        if idx < 0 {
            candidates.sort_by(|a, b| key_fn(a).cmp(&key_fn(b)).then(b.id().cmp(&a.id())));
        } else {
            candidates.sort_by(|a, b| key_fn(a).cmp(&key_fn(b)).then(a.id().cmp(&b.id())));
        }

        let len = candidates.len() as isize;
        let pos = if idx < 0 { len + idx } else { idx };
        if pos < 0 || pos >= len {
            return None;
        }

        Some(candidates[pos as usize].id())
    }

    fn pick_by_workload(&self, idx: isize) -> Option<u32> {
        self.pick_by(|w| w.queue_len(), idx)
    }

    fn pick_by_idleness(&self, idx: isize) -> Option<u32> {
        self.pick_by(|w| w.idle_count(), idx)
    }

    fn pick_by_queue_size(&self, idx: isize) -> Option<u32> {
        self.pick_by(|w| w.queue_len(), idx)
    }

    fn pick_random_non_full(&self) -> Option<u32> {
        let candidates = self.non_full_workers();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.next_usize(candidates.len())].id())
    }

    fn pick_round_robin(&self) -> Option<u32> {
        if self.workers.is_empty() {
            return None;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Some(self.workers[idx].id())
    }

    fn pick_low(&self) -> Option<u32> {
        self.pick_by_workload(-1).or_else(|| self.pick_random_non_full())
    }

    fn pick_normal(&self) -> Option<u32> {
        self.pick_random_non_full().or_else(|| self.pick_round_robin())
    }

    fn pick_high(&self) -> Option<u32> {
        self.pick_by_idleness(-1).or_else(|| self.pick_by_queue_size(0)).or_else(|| self.pick_random_non_full())
    }

    // -------------------------------------------------------------------
    // Work stealing (spec §4.4.3)

    fn on_worker_idle(&self, worker_id: u32, idle_count: u64) {
        if !self.stealing_enabled.load(Ordering::Acquire) {
            return;
        }

        let Some(idle_worker) = self.workers.iter().find(|w| w.id() == worker_id) else {
            return;
        };

        let threshold = idle_worker.max_idle_loop_count() / 1000;
        if idle_count < threshold {
            return;
        }

        let busiest = self.workers.iter().filter(|w| w.id() != worker_id).max_by_key(|w| w.queue_len());
        let Some(busiest) = busiest else {
            return;
        };
        if busiest.queue_len() <= 1 {
            return;
        }

        let Some(task) = busiest.steal_one() else {
            return;
        };

        if let Err(task) = idle_worker.push_stolen(task) {
            if let Err(task) = busiest.push_stolen(task) {
                self.abandon_unstealable_task(task, busiest.id());
            }
        }
    }

    /// Neither the steal nor the return-to-source push landed — the exact
    /// hazard spec §4.4.3 names ("a task lost between pop-from-source and
    /// push-to-target"). The task is still `Queuing`, so dropping it here
    /// would leave its promise stuck forever with nothing to wake a
    /// `wait()` on it. Account for it instead: record where it was
    /// stranded and cancel it rather than lose it silently.
    fn abandon_unstealable_task(&self, task: Task, stranded_worker_id: u32) {
        task.promise.set_last_worker_id(stranded_worker_id);
        task.promise.cancel();
    }
}

fn is_pending(state: TaskState) -> bool {
    matches!(state, TaskState::QUEUING | TaskState::RUNNING) || state == DEPENDS_UNFINISHED
}
