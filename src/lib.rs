#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tp_engine as engine;
pub use tp_os as os;

pub use tp_engine::{
    Pool, PoolBuilder, Priority, SchedulingPolicy, SubmitError, Task, TaskDescription, TaskState,
    TaskPromise, Worker, WorkerConfig,
};
