#![cfg_attr(docsrs, feature(doc_cfg))]

//! The core task execution engine: a bounded lock-free queue, a shared
//! task state machine, single-threaded workers, and a pool dispatcher
//! that places submissions by priority, retries unmet dependencies, and
//! optionally steals work between workers.
//!
//! See [`RingQueue`], [`TaskPromise`], [`Worker`], and [`Pool`] — in that
//! order, leaves first, matching the composition each one builds on.

mod error;
mod pool;
mod ring_queue;
mod task;
mod task_promise;
mod worker;
mod xor_shift;

pub use error::SubmitError;
pub use pool::{Pool, PoolBuilder};
pub use ring_queue::RingQueue;
pub use task::{Priority, Task, TaskBody, TaskDescription};
pub use task_promise::{TaskPromise, TaskState};
pub use tp_os::thread::SchedulingPolicy;
pub use worker::{IdleCallback, Worker, WorkerConfig, DEFAULT_MAX_IDLE_LOOP_COUNT, DEFAULT_MAX_QUEUE_SIZE};
