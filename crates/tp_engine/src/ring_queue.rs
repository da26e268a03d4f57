//! The bounded lock-free MPMC task queue (spec §4.1).
//!
//! Grounded on `tp_os`'s former `ArrayQueue`, itself a from-scratch
//! reimplementation of the `crossbeam-queue` `ArrayQueue` algorithm: each
//! slot carries a sequence-number "stamp" instead of the size-reservation +
//! per-slot full-flag scheme spec.md describes in prose — the spec
//! explicitly allows this substitution ("An implementation MAY substitute
//! an equivalent published MPMC-queue algorithm (e.g., array of
//! sequence-number slots) provided the push/pop contract, ordering
//! guarantees, and bounded-capacity semantics are preserved").
//!
//! Under `cfg(loom)` the atomics and slot storage route through
//! `loom::sync::atomic`/`loom::cell` instead of `std`'s, so
//! `tests/loom.rs` actually drives loom's interleaving checker against
//! this queue's synchronization rather than a `std`-backed stand-in.
#![expect(unsafe_code, reason = "slot storage is manually managed MaybeUninit")]

use std::fmt;
use std::mem::{self, MaybeUninit};
use std::panic::{RefUnwindSafe, UnwindSafe};

#[cfg(not(loom))]
use std::cell::UnsafeCell;
#[cfg(not(loom))]
use std::sync::atomic::{self, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::cell::UnsafeCell;
#[cfg(loom)]
use loom::sync::atomic::{self, AtomicUsize, Ordering};

use tp_os::utils::{Backoff, CachePadded};

// -----------------------------------------------------------------------------
// Internal Type

/// A slot in the queue.
///
/// If the stamp equals the tail, this slot is next to be written to. If it
/// equals head + 1, this slot is next to be read from.
struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    /// Writes `value` into the slot.
    ///
    /// Callers must hold exclusive claim on the slot (established by the
    /// tail/head CAS in `push`/`pop`) before calling this.
    #[cfg(not(loom))]
    unsafe fn write_value(&self, value: T) {
        unsafe {
            self.value.get().write(MaybeUninit::new(value));
        }
    }

    #[cfg(loom)]
    fn write_value(&self, value: T) {
        self.value.with_mut(|v| unsafe { (*v).write(MaybeUninit::new(value)) });
    }

    /// Reads the value out of the slot. Same exclusive-claim precondition
    /// as `write_value`.
    #[cfg(not(loom))]
    unsafe fn read_value(&self) -> T {
        unsafe { self.value.get().read().assume_init() }
    }

    #[cfg(loom)]
    fn read_value(&self) -> T {
        self.value.with_mut(|v| unsafe { (*v).assume_init_read() })
    }

    /// Drops the value currently stored in the slot in place.
    #[cfg(not(loom))]
    unsafe fn drop_value_in_place(&mut self) {
        unsafe {
            (*self.value.get()).assume_init_drop();
        }
    }

    #[cfg(loom)]
    fn drop_value_in_place(&mut self) {
        self.value.with_mut(|v| unsafe { (*v).assume_init_drop() });
    }
}

// -----------------------------------------------------------------------------
// RingQueue

/// A bounded, lock-free multi-producer multi-consumer queue.
///
/// This is the task queue each [`Worker`](crate::Worker) owns: a
/// fixed-capacity buffer allocated at construction, used both as a
/// worker's own inbox and, elsewhere, as a general-purpose thread-safe
/// bounded buffer (spec §2).
///
/// # Examples
///
/// ```
/// use tp_engine::RingQueue;
///
/// let q = RingQueue::new(2);
///
/// assert_eq!(q.push('a'), Ok(()));
/// assert_eq!(q.push('b'), Ok(()));
/// assert_eq!(q.push('c'), Err('c'));
/// assert_eq!(q.pop(), Some('a'));
/// ```
pub struct RingQueue<T> {
    /// A "stamp" packing a lap counter and a buffer index into one `usize`.
    /// Elements are popped from the head.
    head: CachePadded<AtomicUsize>,
    /// Same encoding as `head`. Elements are pushed onto the tail.
    tail: CachePadded<AtomicUsize>,
    /// The buffer holding slots.
    buffer: Box<[Slot<T>]>,
    /// A stamp with the value of `{ lap: 1, index: 0 }`.
    one_lap: usize,
}

unsafe impl<T: Send> Sync for RingQueue<T> {}
unsafe impl<T: Send> Send for RingQueue<T> {}
impl<T> UnwindSafe for RingQueue<T> {}
impl<T> RefUnwindSafe for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Creates a new bounded queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (spec §3: "constructed with capacity ≥ 1").
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");

        let buffer: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        // One lap is the smallest power of two greater than `capacity`.
        let one_lap = (capacity + 1).next_power_of_two();

        Self {
            buffer,
            one_lap,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempts to enqueue a value.
    ///
    /// Returns the value back as `Err` if the queue is full — this is the
    /// Rust encoding of spec §4.1's "Returns true on success, false iff the
    /// queue is full", chosen so a caller that cannot push does not lose
    /// the value it tried to push.
    ///
    /// A successful push happens-before any matching successful pop (spec
    /// §4.1 memory-visibility guarantee): the slot's stamp is stored with
    /// `Release` only after the value is written, and a popper observes it
    /// with `Acquire`.
    pub fn push(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let index = tail & (self.one_lap - 1);
            let lap = tail & !(self.one_lap - 1);

            let new_tail = if index + 1 < self.capacity() {
                tail + 1
            } else {
                lap.wrapping_add(self.one_lap)
            };

            debug_assert!(index < self.buffer.len());
            let slot = unsafe { self.buffer.get_unchecked(index) };
            let stamp = slot.stamp.load(Ordering::Acquire);

            if tail == stamp {
                // The tail and the stamp match: this producer may attempt
                // to claim the slot by advancing the tail.
                match self.tail.compare_exchange_weak(
                    tail,
                    new_tail,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        #[cfg(not(loom))]
                        unsafe {
                            slot.write_value(value);
                        }
                        #[cfg(loom)]
                        slot.write_value(value);

                        slot.stamp.store(tail + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(t) => {
                        tail = t;
                        backoff.spin();
                    }
                }
            } else if stamp.wrapping_add(self.one_lap) == tail + 1 {
                let head = self.head.load(Ordering::SeqCst);

                if head.wrapping_add(self.one_lap) == tail {
                    return Err(value);
                }

                backoff.spin();
                tail = self.tail.load(Ordering::Relaxed);
            } else {
                // The stamp hasn't been updated yet by a pending pop; wait.
                backoff.snooze();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue the oldest value.
    ///
    /// Returns `None` iff the queue is empty, per spec §4.1.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let index = head & (self.one_lap - 1);
            let lap = head & !(self.one_lap - 1);

            debug_assert!(index < self.buffer.len());
            let slot = unsafe { self.buffer.get_unchecked(index) };
            let stamp = slot.stamp.load(Ordering::Acquire);

            if head + 1 == stamp {
                let new = if index + 1 < self.capacity() {
                    head + 1
                } else {
                    lap.wrapping_add(self.one_lap)
                };

                match self.head.compare_exchange_weak(
                    head,
                    new,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        #[cfg(not(loom))]
                        let value = unsafe { slot.read_value() };
                        #[cfg(loom)]
                        let value = slot.read_value();

                        slot.stamp.store(head.wrapping_add(self.one_lap), Ordering::Release);
                        return Some(value);
                    }
                    Err(h) => {
                        head = h;
                        backoff.spin();
                    }
                }
            } else if stamp == head {
                atomic::fence(Ordering::SeqCst);
                let tail = self.tail.load(Ordering::Relaxed);

                if tail == head {
                    return None;
                }

                backoff.spin();
                head = self.head.load(Ordering::Relaxed);
            } else {
                backoff.snooze();
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Returns the queue's fixed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        tail == head
    }

    /// Returns `true` if the queue is at capacity.
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);
        head.wrapping_add(self.one_lap) == tail
    }

    /// Returns a best-effort snapshot of the number of queued elements
    /// (spec §4.1: "best-effort snapshot counters").
    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);

            if self.tail.load(Ordering::SeqCst) == tail {
                let hix = head & (self.one_lap - 1);
                let tix = tail & (self.one_lap - 1);

                return if hix < tix {
                    tix - hix
                } else if hix > tix {
                    self.capacity() - hix + tix
                } else if tail == head {
                    0
                } else {
                    self.capacity()
                };
            }
        }
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            // `&mut self` rules out concurrent access; a relaxed load is
            // enough and avoids depending on `AtomicUsize::get_mut` (not
            // part of loom's mirrored API).
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);

            let hix = head & (self.one_lap - 1);
            let tix = tail & (self.one_lap - 1);

            let len = if hix < tix {
                tix - hix
            } else if hix > tix {
                self.capacity() - hix + tix
            } else if tail == head {
                0
            } else {
                self.capacity()
            };

            for i in 0..len {
                let index = if hix + i < self.capacity() { hix + i } else { hix + i - self.capacity() };

                debug_assert!(index < self.buffer.len());
                #[cfg(not(loom))]
                unsafe {
                    let slot = self.buffer.get_unchecked_mut(index);
                    slot.drop_value_in_place();
                }
                #[cfg(loom)]
                {
                    let slot = &mut self.buffer[index];
                    slot.drop_value_in_place();
                }
            }
        }
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::scope;

    use super::RingQueue;

    #[test]
    fn smoke() {
        let q = RingQueue::new(1);

        q.push(7).unwrap();
        assert_eq!(q.pop(), Some(7));

        q.push(8).unwrap();
        assert_eq!(q.pop(), Some(8));
        assert!(q.pop().is_none());
    }

    #[test]
    fn capacity() {
        for i in 1..10 {
            let q = RingQueue::<i32>::new(i);
            assert_eq!(q.capacity(), i);
        }
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity_panics() {
        RingQueue::<i32>::new(0);
    }

    #[test]
    fn len_empty_full() {
        let q = RingQueue::new(2);

        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
        assert!(!q.is_full());

        q.push(()).unwrap();

        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
        assert!(!q.is_full());

        q.push(()).unwrap();

        assert_eq!(q.len(), 2);
        assert!(!q.is_empty());
        assert!(q.is_full());

        q.pop().unwrap();

        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
        assert!(!q.is_full());
    }

    #[test]
    fn spsc() {
        const COUNT: usize = 100_000;

        let q = RingQueue::new(3);

        scope(|scope| {
            scope.spawn(|| {
                for i in 0..COUNT {
                    loop {
                        if let Some(x) = q.pop() {
                            assert_eq!(x, i);
                            break;
                        }
                    }
                }
                assert!(q.pop().is_none());
            });

            scope.spawn(|| {
                for i in 0..COUNT {
                    while q.push(i).is_err() {}
                }
            });
        });
    }

    /// Spec §8: "for any interleaving of push and pop across N producer and
    /// M consumer threads, the multiset of successfully popped values
    /// equals the multiset of successfully pushed values; no value is
    /// popped twice".
    #[test]
    fn mpmc_multiset_equality() {
        const COUNT: usize = 25_000;
        const THREADS: usize = 4;

        let q = RingQueue::<usize>::new(3);
        let seen: Vec<AtomicUsize> = (0..COUNT).map(|_| AtomicUsize::new(0)).collect();

        scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..COUNT {
                        let n = loop {
                            if let Some(x) = q.pop() {
                                break x;
                            }
                        };
                        seen[n].fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for i in 0..COUNT {
                        while q.push(i).is_err() {}
                    }
                });
            }
        });

        for count in seen {
            assert_eq!(count.load(Ordering::SeqCst), THREADS);
        }
    }

    /// Concrete scenario from spec §8: capacity-10 queue, 10 producers push
    /// 100 distinct values each, 10 consumers pop 100 each into a second
    /// capacity-1000 queue; the recovered 1000 values form `0..1000` with
    /// no duplicates.
    #[test]
    fn ring_queue_multi_writer() {
        const PRODUCERS: usize = 10;
        const PER_PRODUCER: usize = 100;

        let source = RingQueue::<usize>::new(10);
        let sink = RingQueue::<usize>::new(1000);

        scope(|scope| {
            for p in 0..PRODUCERS {
                scope.spawn(|| {
                    for i in 0..PER_PRODUCER {
                        let value = p * PER_PRODUCER + i;
                        while source.push(value).is_err() {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..PRODUCERS {
                scope.spawn(|| {
                    for _ in 0..PER_PRODUCER {
                        loop {
                            if let Some(v) = source.pop() {
                                while sink.push(v).is_err() {
                                    std::thread::yield_now();
                                }
                                break;
                            }
                        }
                    }
                });
            }
        });

        let mut collected = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
        while let Some(v) = sink.pop() {
            collected.push(v);
        }
        collected.sort_unstable();
        let expected: Vec<usize> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(collected, expected);
    }
}

