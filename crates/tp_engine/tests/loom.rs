//! `loom` interleaving check for the ring queue, run with
//! `RUSTFLAGS="--cfg loom" cargo test --test loom --release`.
//!
//! Grounded on the pack's `game_tasks` crate, which exercises its own
//! lock-free park/unpark primitive the same way (`loom::model` wrapping a
//! smoke test over `loom::sync`/`loom::thread`).
#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;

use tp_engine::RingQueue;

#[test]
fn push_pop_interleavings() {
    loom::model(|| {
        let q = Arc::new(RingQueue::new(2));

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                q.push(1).unwrap();
            })
        };

        let popped = q.pop();
        producer.join().unwrap();

        if popped.is_none() {
            assert_eq!(q.pop(), Some(1));
        } else {
            assert_eq!(popped, Some(1));
        }
    });
}

#[test]
fn concurrent_push_and_pop_preserve_capacity() {
    loom::model(|| {
        let q = Arc::new(RingQueue::new(1));

        let q2 = q.clone();
        let popper = thread::spawn(move || q2.pop());

        let pushed = q.push(7).is_ok();
        let popped = popper.join().unwrap();

        if !pushed {
            assert!(popped.is_none());
        }
    });
}
