use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Bookkeeping bits stored atomically in every [`Header`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// The reference count is maintained with atomic read-modify-writes.
        /// Set transitively the moment a second thread could observe the
        /// object; never cleared afterwards.
        const SHARED = 1 << 0;
        /// The object's type admits reference cycles. Its storage is returned
        /// by the cycle collector, never by a mutator.
        const CYCLIC = 1 << 1;
        /// The final free of this object has been handed to the collector.
        const SWEEP = 1 << 2;
        /// The object is currently registered as a suspected cycle root.
        const BUFFERED = 1 << 3;
    }
}

/// The header at the start of every heap allocation.
///
/// An allocation is the header followed immediately by `field_len` nullable
/// object slots:
///
/// ```text
/// [ strong | field_len | flags | lock ] [ slot 0 ] [ slot 1 ] ...
/// ```
///
/// The count starts at one, owned by the creating handle. Whether count
/// updates are atomic is decided per object by [`HeaderFlags::SHARED`]; the
/// flag is stable once the object is visible to more than one thread, so the
/// branch predicts perfectly.
#[repr(C)]
pub struct Header {
    strong: AtomicUsize,
    field_len: usize,
    flags: AtomicU8,
    lock: AtomicBool,
}

impl Header {
    pub fn new(field_len: usize) -> Self {
        Self {
            strong: AtomicUsize::new(1),
            field_len,
            flags: AtomicU8::new(HeaderFlags::empty().bits()),
            lock: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn field_len(&self) -> usize {
        self.field_len
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn is_shared(&self) -> bool {
        self.flags().contains(HeaderFlags::SHARED)
    }

    #[inline(always)]
    pub fn is_cyclic(&self) -> bool {
        self.flags().contains(HeaderFlags::CYCLIC)
    }

    /// Switch the count to atomic maintenance. Relaxed is enough: the flag
    /// is written while the object is still confined to one thread, and the
    /// publishing store that makes the object visible synchronizes memory.
    #[inline(always)]
    pub fn mark_shared(&self) {
        self.flags.fetch_or(HeaderFlags::SHARED.bits(), Ordering::Relaxed);
    }

    /// Tag the object as able to participate in reference cycles. Must
    /// happen before the object becomes visible to another thread.
    #[inline(always)]
    pub fn mark_cyclic(&self) {
        self.flags.fetch_or(HeaderFlags::CYCLIC.bits(), Ordering::Relaxed);
    }

    /// Delegate the final free of this object to the collector.
    #[inline(always)]
    pub fn mark_for_sweep(&self) {
        self.flags.fetch_or(HeaderFlags::SWEEP.bits(), Ordering::Release);
    }

    #[inline(always)]
    pub fn is_marked_for_sweep(&self) -> bool {
        let flags = HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        flags.contains(HeaderFlags::SWEEP)
    }

    /// Attempt to claim the buffered bit. Exactly one caller wins until the
    /// bit is cleared again; the winner inserts the object into the
    /// suspected-root buffer.
    #[inline(always)]
    pub fn try_buffer(&self) -> bool {
        let prev = self.flags.fetch_or(HeaderFlags::BUFFERED.bits(), Ordering::Relaxed);
        !HeaderFlags::from_bits_truncate(prev).contains(HeaderFlags::BUFFERED)
    }

    #[inline(always)]
    pub fn is_buffered(&self) -> bool {
        self.flags().contains(HeaderFlags::BUFFERED)
    }

    #[inline(always)]
    pub fn clear_buffered(&self) {
        self.flags.fetch_and(!HeaderFlags::BUFFERED.bits(), Ordering::Relaxed);
    }

    // ── reference count ────────────────────────────────────────────

    #[inline(always)]
    pub fn strong(&self) -> usize {
        self.strong.load(Ordering::Relaxed)
    }

    /// The count as observed by the collector during marking.
    #[inline(always)]
    pub fn strong_acquire(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    /// Add one owning reference, in the mode selected by `SHARED`.
    #[inline(always)]
    pub fn retain(&self) {
        if self.is_shared() {
            self.strong.fetch_add(1, Ordering::Relaxed);
        } else {
            // Exclusive mode: a single owning thread, so a plain
            // read-modify-write is enough.
            let n = self.strong.load(Ordering::Relaxed);
            self.strong.store(n + 1, Ordering::Relaxed);
        }
    }

    /// Drop one owning reference; returns the count before the decrement.
    #[inline(always)]
    pub fn release(&self) -> usize {
        if self.is_shared() {
            let prev = self.strong.fetch_sub(1, Ordering::Release);
            debug_assert!(prev > 0, "released a shared object with a zero count");
            prev
        } else {
            let n = self.strong.load(Ordering::Relaxed);
            debug_assert!(n > 0, "released an exclusive object with a zero count");
            self.strong.store(n - 1, Ordering::Relaxed);
            n
        }
    }

    /// Decrement atomically regardless of mode; returns the previous count.
    /// Used on the out-edges of a dying cyclic object, which the collector
    /// may be counting concurrently.
    #[inline(always)]
    pub fn release_atomic(&self) -> usize {
        let prev = self.strong.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "atomic release on a zero count");
        prev
    }

    // ── object lock ────────────────────────────────────────────────

    /// Spin with acquire semantics until the lock bit transitions 0 → 1.
    #[inline]
    pub fn lock(&self) {
        while self.lock.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("strong", &self.strong())
            .field("field_len", &self.field_len)
            .field("flags", &self.flags())
            .finish()
    }
}
