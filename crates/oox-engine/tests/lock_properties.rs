//! Property tests for the lock table.

use oox_engine::LockSet;
use proptest::prelude::*;

/// An arbitrary lock/unlock workload over a few references and threads.
fn workload() -> impl Strategy<Value = Vec<(i64, u64, bool)>> {
    prop::collection::vec((1i64..8, 0u64..4, any::<bool>()), 0..32)
}

fn replay(ops: &[(i64, u64, bool)]) -> LockSet {
    let mut locks = LockSet::new();
    for (reference, tid, is_acquire) in ops {
        if *is_acquire {
            let _ = locks.acquire(*reference, *tid);
        } else {
            locks.release(*reference);
        }
    }
    locks
}

proptest! {
    // Re-acquiring a held lock on the same thread changes nothing.
    #[test]
    fn acquire_is_idempotent(ops in workload(), reference in 1i64..8, tid in 0u64..4) {
        let mut once = replay(&ops);
        let mut twice = replay(&ops);

        let first = once.acquire(reference, tid);
        let second_a = twice.acquire(reference, tid);
        let second_b = twice.acquire(reference, tid);

        prop_assert_eq!(first, second_a);
        prop_assert_eq!(second_a, second_b);
        prop_assert_eq!(once.holder(reference), twice.holder(reference));
    }

    // A successful acquire makes the thread the holder; a failed acquire
    // leaves the previous holder in place.
    #[test]
    fn holder_tracks_successful_acquires(ops in workload(), reference in 1i64..8, tid in 0u64..4) {
        let mut locks = replay(&ops);
        let before = locks.holder(reference);
        let acquired = locks.acquire(reference, tid);
        if acquired {
            prop_assert_eq!(locks.holder(reference), Some(tid));
        } else {
            prop_assert_ne!(before, Some(tid));
            prop_assert_eq!(locks.holder(reference), before);
        }
    }

    // Release always clears the mapping, held or not.
    #[test]
    fn release_clears_holder(ops in workload(), reference in 1i64..8) {
        let mut locks = replay(&ops);
        locks.release(reference);
        prop_assert_eq!(locks.holder(reference), None);
    }
}
