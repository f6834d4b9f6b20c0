//! Allocation and reference-count maintenance for graph objects.
//!
//! Objects hold owning pointers to each other and may form cycles. Acyclic
//! objects are torn down by whichever mutator drops the last count; objects
//! of a cyclic type are handed to the cycle collector instead (see
//! [`Heap::collect`]).
//!
//! All operations take raw [`Obj`] pointers and are unsafe; the handle types
//! layered on top own the liveness reasoning.

use std::alloc::{alloc, dealloc, handle_alloc_error};
use std::collections::HashSet;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

use object::{Header, Obj, SpinLock, allocation_layout};

pub type ObjSet = HashSet<Obj, ahash::RandomState>;

/// Shared runtime state.
#[derive(Debug, Default)]
pub struct HeapInner {
    /// Candidate cycle roots, guarded by their own spin lock. Membership and
    /// the per-object `BUFFERED` bit always agree.
    pub suspects: SpinLock<ObjSet>,
    /// Serializes collection passes. Mutators never take this.
    pub collect_lock: Mutex<()>,
    /// Number of allocations not yet freed.
    pub live: AtomicUsize,
}

// SAFETY: `Obj` entries are plain addresses; the suspect buffer is guarded
// by its spin lock and everything else is atomic.
unsafe impl Send for HeapInner {}
// SAFETY: see above
unsafe impl Sync for HeapInner {}

/// Handle on the shared runtime. Clones are shallow.
#[derive(Debug, Clone, Default)]
pub struct Heap(Arc<HeapInner>);

impl Deref for Heap {
    type Target = HeapInner;

    fn deref(&self) -> &HeapInner {
        &self.0
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently allocated. Zero after a quiescent
    /// teardown: all handles dropped and `collect` run to a fixpoint.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocate an object with `field_len` null slots and a count of one.
    ///
    /// Aborts the process if the underlying allocator is exhausted.
    pub fn allocate(&self, field_len: usize) -> Obj {
        let layout = allocation_layout(field_len);
        // SAFETY: the layout has at least header size
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<Header>()) else {
            handle_alloc_error(layout);
        };
        let obj = Obj::from_header(ptr);
        // SAFETY: freshly allocated with the matching layout
        unsafe {
            ptr.as_ptr().write(Header::new(field_len));
            for index in 0..field_len {
                obj.set_field(index, None);
            }
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        obj
    }

    /// Return an object's storage to the allocator.
    ///
    /// # Safety
    ///
    /// Every owning reference must already be gone and no handle may touch
    /// the object afterwards.
    pub unsafe fn free(&self, obj: Obj) {
        // SAFETY: the object is live until the dealloc below
        let layout = unsafe { allocation_layout(obj.field_len()) };
        // SAFETY: allocated by `allocate` with this layout
        unsafe { dealloc(obj.as_ptr().cast(), layout) };
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Tag `obj` as able to participate in reference cycles.
    ///
    /// # Safety
    ///
    /// `obj` must be live and not yet visible to any other thread.
    pub unsafe fn mark_cyclic(&self, obj: Obj) {
        // SAFETY: per contract
        unsafe { obj.header().mark_cyclic() }
    }

    /// Transitively switch `obj` to atomic counting ahead of publication.
    ///
    /// # Safety
    ///
    /// `obj` must be live and not yet visible to any other thread.
    pub unsafe fn promote_shared(&self, obj: Obj) {
        // SAFETY: per contract
        unsafe { obj.promote_shared() }
    }

    /// Add one owning reference to `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be live.
    pub unsafe fn retain(&self, obj: Obj) {
        // SAFETY: per contract
        unsafe { obj.retain() }
    }

    /// Drop one owning reference to `obj`.
    ///
    /// A decrement that leaves a positive count on a cyclic-typed object
    /// makes it a suspected cycle root: only internal references may be
    /// left. A decrement to zero frees an acyclic object on the spot and
    /// hands a cyclic one to the collector.
    ///
    /// # Safety
    ///
    /// `obj` must be live and the caller must own the reference it drops.
    pub unsafe fn release(&self, obj: Obj) {
        // SAFETY: live per contract
        let header = unsafe { obj.header() };
        let prev = header.release();
        if prev > 1 {
            if prev == 2 && header.is_cyclic() {
                self.suspect(obj);
            }
        } else if header.is_cyclic() {
            // SAFETY: the count just reached zero and we hold the carcass
            unsafe { self.drop_cyclic(obj) };
            // The collector must visit the carcass to free it, even if the
            // object was never suspected while alive.
            self.suspect(obj);
        } else {
            // Pairs with the release decrements: observe all writes into the
            // dying object before tearing it down.
            fence(Ordering::Acquire);
            // SAFETY: sole owner of a dead acyclic object
            unsafe {
                for index in 0..header.field_len() {
                    if let Some(child) = obj.field(index) {
                        self.release(child);
                    }
                }
                self.free(obj);
            }
        }
    }

    /// Register `obj` as a suspected cycle root. The `BUFFERED` bit makes
    /// the insertion idempotent across threads.
    pub(crate) fn suspect(&self, obj: Obj) {
        // SAFETY: callers pass live objects
        if unsafe { obj.header().try_buffer() } {
            self.suspects.lock().insert(obj);
        }
    }

    /// Detach a dying cyclic object from its children and leave the carcass
    /// for the collector.
    ///
    /// Children are decremented atomically even in exclusive mode: the
    /// collector may be counting them concurrently. A child that dies here
    /// is dropped recursively; if it is already queued as a suspect its slot
    /// is nulled first so the collector does not walk the same edge twice. A
    /// child that survives is unlinked outright.
    ///
    /// # Safety
    ///
    /// `obj` must be live with a count of zero.
    unsafe fn drop_cyclic(&self, obj: Obj) {
        // SAFETY: liveness per contract; slot access under the object lock
        unsafe {
            let header = obj.header();
            header.lock();
            for index in 0..header.field_len() {
                let Some(child) = obj.field(index) else { continue };
                let child_header = child.header();
                let prev = child_header.release_atomic();
                if prev == 1 {
                    fence(Ordering::Acquire);
                    if child_header.is_cyclic() && child_header.is_buffered() {
                        obj.set_field(index, None);
                    }
                    self.drop_cyclic(child);
                } else {
                    obj.set_field(index, None);
                }
            }
            header.unlock();
            header.mark_for_sweep();
        }
    }

    /// Store `child` into slot `index` of `obj`, retaining the child and
    /// releasing whatever the slot held.
    ///
    /// Storing into a shared object publishes the child, so an
    /// exclusive-mode child has its whole subgraph promoted to atomic
    /// counting first.
    ///
    /// # Safety
    ///
    /// Both objects must be live, `index` in range, and an exclusive `child`
    /// confined to the calling thread.
    pub unsafe fn field_store(&self, obj: Obj, index: usize, child: Option<Obj>) {
        // SAFETY: per contract; slot access under the object lock
        unsafe {
            let header = obj.header();
            debug_assert!(index < header.field_len(), "field index out of range");
            if header.is_shared() {
                if let Some(child) = child {
                    child.promote_shared();
                }
            }
            header.lock();
            if let Some(child) = child {
                child.retain();
            }
            let old = obj.field(index);
            obj.set_field(index, child);
            header.unlock();
            if let Some(old) = old {
                self.release(old);
            }
        }
    }

    /// Read slot `index` of `obj`, retaining the result before returning it.
    ///
    /// # Safety
    ///
    /// `obj` must be live and `index` in range.
    pub unsafe fn field_load(&self, obj: Obj, index: usize) -> Option<Obj> {
        // SAFETY: per contract; the lock keeps the child alive until it is
        // retained, because a competing store cannot release it meanwhile.
        unsafe {
            let header = obj.header();
            debug_assert!(index < header.field_len(), "field index out of range");
            if header.is_shared() {
                header.lock();
                let child = obj.field(index);
                if let Some(child) = child {
                    child.retain();
                }
                header.unlock();
                child
            } else {
                let child = obj.field(index);
                if let Some(child) = child {
                    child.retain();
                }
                child
            }
        }
    }
}
