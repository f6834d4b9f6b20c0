use std::alloc::Layout;
use std::ptr::NonNull;

use crate::Header;

/// An untyped pointer to a heap object.
///
/// `Obj` is a plain address: copying it does not touch the reference count,
/// and every dereferencing accessor is unsafe. Ownership lives in the counts
/// themselves — a slot holding an `Obj` owns one increment of its target.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Obj(NonNull<Header>);

// The slot array starts at `header_ptr + 1`; this only lines up with
// `Layout::extend` if the header size is already slot-aligned.
const _: () = assert!(size_of::<Header>() % align_of::<Option<Obj>>() == 0);

impl Obj {
    #[inline(always)]
    pub fn from_header(ptr: NonNull<Header>) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut Header {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The object must be live.
    #[inline(always)]
    pub unsafe fn header<'a>(self) -> &'a Header {
        // SAFETY: caller guarantees liveness
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// The object must be live.
    #[inline(always)]
    pub unsafe fn field_len(self) -> usize {
        // SAFETY: caller guarantees liveness
        unsafe { self.header().field_len() }
    }

    #[inline(always)]
    fn slots_ptr(self) -> *mut Option<Obj> {
        // SAFETY: pointer arithmetic within the allocation; the slot array
        // starts immediately after the header.
        unsafe { self.0.as_ptr().add(1).cast::<Option<Obj>>() }
    }

    /// Read slot `index` without synchronization.
    ///
    /// # Safety
    ///
    /// The object must be live, `index` in range, and the read ordered
    /// against concurrent stores: either the object's lock is held or the
    /// object is confined to the calling thread.
    #[inline(always)]
    pub unsafe fn field(self, index: usize) -> Option<Obj> {
        // SAFETY: per the contract above
        unsafe {
            debug_assert!(index < self.field_len(), "field index out of range");
            self.slots_ptr().add(index).read()
        }
    }

    /// Write slot `index` without adjusting any reference count.
    ///
    /// # Safety
    ///
    /// Same as [`Obj::field`], plus the caller takes over the count
    /// bookkeeping for both the old and the new occupant.
    #[inline(always)]
    pub unsafe fn set_field(self, index: usize, child: Option<Obj>) {
        // SAFETY: per the contract above
        unsafe {
            debug_assert!(index < self.field_len(), "field index out of range");
            self.slots_ptr().add(index).write(child);
        }
    }

    /// Bump the count on behalf of a new owning reference.
    ///
    /// # Safety
    ///
    /// The object must be live.
    #[inline(always)]
    pub unsafe fn retain(self) {
        // SAFETY: caller guarantees liveness
        unsafe { self.header().retain() }
    }

    /// Flip this object and everything reachable from it to atomic counting.
    ///
    /// No locks are taken: the caller owns the only handle, so nothing else
    /// can touch the subgraph until it is published. Recursion stops at nodes
    /// that are already shared — their descendants are shared too.
    ///
    /// # Safety
    ///
    /// The object must be live and not yet visible to any other thread.
    pub unsafe fn promote_shared(self) {
        // SAFETY: the subgraph is confined to the calling thread
        unsafe {
            let header = self.header();
            if header.is_shared() {
                return;
            }
            header.mark_shared();
            for index in 0..header.field_len() {
                if let Some(child) = self.field(index) {
                    child.promote_shared();
                }
            }
        }
    }
}

impl core::fmt::Debug for Obj {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Obj({:p})", self.0.as_ptr())
    }
}

/// Layout of an allocation holding a header and `field_len` slots.
pub fn allocation_layout(field_len: usize) -> Layout {
    let slots = Layout::array::<Option<Obj>>(field_len).expect("slot array too large");
    let (layout, offset) = Layout::new::<Header>().extend(slots).expect("allocation too large");
    debug_assert_eq!(offset, size_of::<Header>());
    layout.pad_to_align()
}
