mod header;
mod lock;
mod obj;

pub use header::{Header, HeaderFlags};
pub use lock::{SpinLock, SpinLockGuard};
pub use obj::{Obj, allocation_layout};

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // ── Header flags ───────────────────────────────────────────────

    #[test]
    fn fresh_header_defaults() {
        let h = Header::new(3);
        assert_eq!(h.strong(), 1);
        assert_eq!(h.field_len(), 3);
        assert_eq!(h.flags(), HeaderFlags::empty());
        assert!(!h.is_shared());
        assert!(!h.is_cyclic());
        assert!(!h.is_marked_for_sweep());
        assert!(!h.is_buffered());
    }

    #[test]
    fn flags_are_independent() {
        let h = Header::new(0);
        h.mark_cyclic();
        assert!(h.is_cyclic());
        assert!(!h.is_shared());

        h.mark_shared();
        assert!(h.is_cyclic());
        assert!(h.is_shared());

        h.mark_for_sweep();
        assert!(h.is_marked_for_sweep());
        assert!(h.is_cyclic(), "sweep must not disturb other flags");
    }

    #[test]
    fn try_buffer_has_exactly_one_winner() {
        let h = Header::new(0);
        assert!(h.try_buffer(), "first claim should win");
        assert!(!h.try_buffer(), "second claim must be rejected");
        assert!(h.is_buffered());

        h.clear_buffered();
        assert!(!h.is_buffered());
        assert!(h.try_buffer(), "claim should work again after clearing");
    }

    #[test]
    fn try_buffer_races_to_a_single_winner() {
        let h = Header::new(0);
        let winners = std::sync::atomic::AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if h.try_buffer() {
                        winners.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(
            winners.load(std::sync::atomic::Ordering::Relaxed),
            1,
            "exactly one thread should claim the buffered bit"
        );
    }

    // ── Reference count modes ──────────────────────────────────────

    #[test]
    fn exclusive_retain_release_round_trip() {
        let h = Header::new(0);
        h.retain();
        h.retain();
        assert_eq!(h.strong(), 3);

        assert_eq!(h.release(), 3);
        assert_eq!(h.release(), 2);
        assert_eq!(h.strong(), 1);
    }

    #[test]
    fn shared_retain_release_round_trip() {
        let h = Header::new(0);
        h.mark_shared();
        h.retain();
        assert_eq!(h.strong(), 2);
        assert_eq!(h.release(), 2);
        assert_eq!(h.strong(), 1);
    }

    #[test]
    fn shared_count_survives_contention() {
        let h = Header::new(0);
        h.mark_shared();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        h.retain();
                        h.release();
                    }
                });
            }
        });

        assert_eq!(h.strong(), 1, "balanced retain/release must restore the count");
    }

    #[test]
    fn release_atomic_works_in_either_mode() {
        let exclusive = Header::new(0);
        exclusive.retain();
        assert_eq!(exclusive.release_atomic(), 2);
        assert_eq!(exclusive.strong(), 1);

        let shared = Header::new(0);
        shared.mark_shared();
        assert_eq!(shared.release_atomic(), 1);
        assert_eq!(shared.strong(), 0);
    }

    // ── Object lock ────────────────────────────────────────────────

    #[test]
    fn object_lock_is_mutually_exclusive() {
        struct Guarded {
            header: Header,
            counter: std::cell::UnsafeCell<u64>,
        }
        // SAFETY: `counter` is only touched under the object lock.
        unsafe impl Sync for Guarded {}

        let shared = Guarded {
            header: Header::new(0),
            counter: std::cell::UnsafeCell::new(0),
        };

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let shared = &shared;
                    for _ in 0..25_000 {
                        shared.header.lock();
                        // SAFETY: the object lock serializes access
                        unsafe { *shared.counter.get() += 1 };
                        shared.header.unlock();
                    }
                });
            }
        });

        let total = unsafe { *shared.counter.get() };
        assert_eq!(total, 100_000, "increments must not be lost under the lock");
    }

    // ── SpinLock ───────────────────────────────────────────────────

    #[test]
    fn spin_lock_guard_gives_mutable_access() {
        let lock = SpinLock::new(Vec::new());
        lock.lock().push(1);
        lock.lock().push(2);
        assert_eq!(*lock.lock(), vec![1, 2]);
    }

    #[test]
    fn spin_lock_serializes_threads() {
        let lock = SpinLock::new(0u64);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });

        assert_eq!(*lock.lock(), 80_000, "increments must not be lost under the lock");
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn allocation_layout_sizes() {
        let header = size_of::<Header>();
        let slot = size_of::<Option<Obj>>();
        assert_eq!(allocation_layout(0).size(), header);
        assert_eq!(allocation_layout(1).size(), header + slot);
        assert_eq!(allocation_layout(4).size(), header + 4 * slot);
    }

    #[test]
    fn slots_are_pointer_sized() {
        // The null niche keeps a nullable slot at one word.
        assert_eq!(size_of::<Option<Obj>>(), size_of::<usize>());
    }
}
