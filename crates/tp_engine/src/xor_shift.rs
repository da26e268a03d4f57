//! A small, dependency-free PRNG for the placement policy's randomized
//! tie-breaking (spec §4.4.2: "Normal: uniform random among non-full
//! workers"). Grounded on the teacher crate's own `XorShift64Star`, used
//! there to pick a victim among its async task pool's local queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A xorshift64* generator. Not cryptographically secure; good enough for
/// load-balancing tie-breaks.
///
/// Backed by an `AtomicU64` rather than a `Cell` because a [`Pool`](crate::Pool)
/// is shared across worker and submitter threads behind an `Arc`: placement
/// reads are already documented as racy and tolerant of staleness (spec
/// §5, "Pool's placement policy reads worker counters without locks and
/// tolerates racy reads"), so a relaxed, non-atomic-RMW update here — an
/// occasional lost draw between two racing submitters — is consistent with
/// that contract, not a bug to guard against.
pub(crate) struct XorShift64Star {
    state: AtomicU64,
}

impl XorShift64Star {
    /// Seeds from a process-wide counter mixed with the current time, so
    /// distinct pools (and distinct calls within a pool) don't all draw
    /// the same sequence.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);

        Self::fixed(now ^ count.wrapping_mul(0x9E3779B97F4A7C15))
    }

    /// Seeds with a fixed value (never zero — xorshift is stuck at zero).
    pub(crate) const fn fixed(seed: u64) -> Self {
        XorShift64Star { state: AtomicU64::new(if seed == 0 { 0xDEAD_BEEF_CAFE_F00D } else { seed }) }
    }

    fn next_u64(&self) -> u64 {
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Returns a value in `0..n`. Returns 0 if `n == 0`.
    pub(crate) fn next_usize(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (self.next_u64() % n as u64) as usize
    }
}
