#![cfg_attr(docsrs, feature(doc_cfg))]

//! Platform layer for `taskforge`.
//!
//! This is the "platform" collaborator the core engine crate (`tp_engine`)
//! expects: the ability to spawn a named, joinable OS thread, a best-effort
//! scheduling-priority shim, a monotonic clock, and the handful of
//! lock-free primitives (exponential backoff, cache-line padding) the
//! engine's ring queue is built from.
//!
//! Everything here is a thin, direct wrapper around the standard library —
//! there is intentionally no no_std/wasm fallback layer, because the engine
//! is defined in terms of real OS threads and blocking waits.

pub mod thread;
pub mod time;
pub mod utils;
