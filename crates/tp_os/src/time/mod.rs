//! The monotonic clock named in spec §6.
//!
//! A direct re-export of [`std::time::Instant`] — std's `Instant` is
//! already monotonic on every platform it ships on, so there is nothing to
//! wrap.

pub use std::time::{Duration, Instant};
