//! Thread spawning and the scheduling-priority shim.
//!
//! The engine asks this module for exactly two things (spec §6): the
//! ability to spawn a joinable OS thread and give it a short name, and a
//! best-effort way to set the thread's scheduling policy and priority.
//! Neither failure is fatal — both are logged and the caller proceeds with
//! platform defaults.

pub use std::thread::sleep;

use std::io;
use std::num::NonZero;
use std::thread::{Builder, JoinHandle};

/// Scheduling policy requested for a worker thread.
///
/// Support for anything beyond the default `Other` policy is platform- and
/// privilege-dependent (e.g. `RoundRobin`/`Fifo` on Linux require
/// `CAP_SYS_NICE` or root). [`try_set_scheduling`] logs a warning and keeps
/// running under `Other` when the request cannot be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Platform default time-sharing policy.
    #[default]
    Other,
    /// Round-robin real-time policy.
    RoundRobin,
    /// First-in-first-out real-time policy.
    Fifo,
}

/// Spawns a joinable OS thread and names it.
///
/// Thread naming is silently a no-op on platforms whose `std` does not
/// support it; everywhere else the name shows up in debuggers and
/// `/proc`-style tooling, which is the entire point of carrying it at all.
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().name(name.into()).spawn(f)
}

/// Best-effort request to change the calling thread's scheduling policy and
/// priority.
///
/// `std` has no portable API for this, so outside of a `libc`/`winapi`
/// dependency there is nothing real to call; this keeps the seam the spec
/// names (spec §6: "optional: set thread scheduling policy ... with an
/// integer priority. Failures are logged but non-fatal") without pulling in
/// a platform-specific dependency the rest of the crate has no other use
/// for. Requesting anything other than [`SchedulingPolicy::Other`] always
/// logs a warning and returns `Err`.
pub fn try_set_scheduling(policy: SchedulingPolicy, priority: i32) -> io::Result<()> {
    if policy == SchedulingPolicy::Other {
        return Ok(());
    }

    log::warn!(
        "failed to set thread scheduling policy {policy:?} (priority {priority}): \
         no portable scheduling API available on this platform"
    );
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Returns an estimate of the default amount of parallelism, never zero.
pub fn available_parallelism() -> NonZero<usize> {
    std::thread::available_parallelism().unwrap_or(NonZero::new(1).unwrap())
}
