use heap::Heap;
use object::Obj;

/// Handle with no automatic management: nothing is retained or released, and
/// teardown is an explicit call. The baseline the counted handles are
/// measured against.
pub struct ManualRef<'h> {
    heap: &'h Heap,
    obj: Obj,
}

impl<'h> ManualRef<'h> {
    pub fn new(heap: &'h Heap, field_len: usize) -> Self {
        Self { heap, obj: heap.allocate(field_len) }
    }

    pub fn obj(&self) -> Obj {
        self.obj
    }

    /// Link `child` into slot `index` without touching any count.
    pub fn set(&self, index: usize, child: &ManualRef<'h>) {
        // SAFETY: both objects are live (nothing frees them before
        // `delete_tree`) and confined to this thread
        unsafe { self.obj.set_field(index, Some(child.obj)) };
    }

    /// Free the tree rooted here. Only valid for trees: a shared child would
    /// be freed once per inbound edge.
    pub fn delete_tree(self) {
        // SAFETY: the caller owns the whole tree
        unsafe { delete_tree(self.heap, self.obj) };
    }
}

unsafe fn delete_tree(heap: &Heap, obj: Obj) {
    // SAFETY: tree ownership per the caller's contract
    unsafe {
        for index in 0..obj.field_len() {
            if let Some(child) = obj.field(index) {
                delete_tree(heap, child);
            }
        }
        heap.free(obj);
    }
}

/// Reference-counted handle for single-thread object graphs. Objects stay in
/// exclusive (non-atomic) mode for their whole life, so every count update
/// is a plain load/store pair.
pub struct LocalRc<'h> {
    heap: &'h Heap,
    obj: Obj,
}

impl<'h> LocalRc<'h> {
    pub fn new(heap: &'h Heap, field_len: usize) -> Self {
        Self { heap, obj: heap.allocate(field_len) }
    }

    pub fn obj(&self) -> Obj {
        self.obj
    }

    pub fn set(&self, index: usize, child: Option<&LocalRc<'h>>) {
        // SAFETY: both handles keep their objects live
        unsafe { self.heap.field_store(self.obj, index, child.map(|c| c.obj)) };
    }

    pub fn get(&self, index: usize) -> Option<LocalRc<'h>> {
        // SAFETY: the handle keeps the object live; the load retains the child
        unsafe { self.heap.field_load(self.obj, index) }
            .map(|obj| LocalRc { heap: self.heap, obj })
    }
}

impl Clone for LocalRc<'_> {
    fn clone(&self) -> Self {
        // SAFETY: live for as long as `self`
        unsafe { self.heap.retain(self.obj) };
        Self { heap: self.heap, obj: self.obj }
    }
}

impl Drop for LocalRc<'_> {
    fn drop(&mut self) {
        // SAFETY: drops the count this handle owns
        unsafe { self.heap.release(self.obj) };
    }
}

/// Reference-counted handle whose object is in atomic mode from birth, so
/// handles may be shared and sent across threads freely.
pub struct SyncRc<'h> {
    heap: &'h Heap,
    obj: Obj,
}

// SAFETY: the object and everything ever stored below it is in atomic mode,
// and slot access goes through the object lock.
unsafe impl Send for SyncRc<'_> {}
// SAFETY: see above
unsafe impl Sync for SyncRc<'_> {}

impl<'h> SyncRc<'h> {
    pub fn new(heap: &'h Heap, field_len: usize) -> Self {
        let obj = heap.allocate(field_len);
        // SAFETY: just allocated, still private to this thread
        unsafe { heap.promote_shared(obj) };
        Self { heap, obj }
    }

    pub fn obj(&self) -> Obj {
        self.obj
    }

    pub fn set(&self, index: usize, child: Option<&SyncRc<'h>>) {
        // SAFETY: both handles keep their objects live
        unsafe { self.heap.field_store(self.obj, index, child.map(|c| c.obj)) };
    }

    pub fn get(&self, index: usize) -> Option<SyncRc<'h>> {
        // SAFETY: the handle keeps the object live; the load retains the child
        unsafe { self.heap.field_load(self.obj, index) }
            .map(|obj| SyncRc { heap: self.heap, obj })
    }
}

impl Clone for SyncRc<'_> {
    fn clone(&self) -> Self {
        // SAFETY: live for as long as `self`
        unsafe { self.heap.retain(self.obj) };
        Self { heap: self.heap, obj: self.obj }
    }
}

impl Drop for SyncRc<'_> {
    fn drop(&mut self) {
        // SAFETY: drops the count this handle owns
        unsafe { self.heap.release(self.obj) };
    }
}

/// Reference-counted handle that starts in exclusive mode and switches to
/// atomic counting when published.
///
/// The handle itself never crosses a thread boundary; publication happens by
/// storing it into a [`SharedSlots`] anchor (or any shared object), which
/// promotes the subgraph first. Handles read back out of shared storage
/// refer to already-promoted objects and are safe to use on the reading
/// thread.
pub struct DynRc<'h> {
    heap: &'h Heap,
    obj: Obj,
}

impl<'h> DynRc<'h> {
    pub fn new(heap: &'h Heap, field_len: usize) -> Self {
        Self { heap, obj: heap.allocate(field_len) }
    }

    pub fn obj(&self) -> Obj {
        self.obj
    }

    /// Tag the object as able to participate in cycles. Call before the
    /// handle is published anywhere.
    pub fn mark_cyclic(&self) {
        // SAFETY: the handle keeps the object live
        unsafe { self.heap.mark_cyclic(self.obj) };
    }

    pub fn set(&self, index: usize, child: Option<&DynRc<'h>>) {
        // SAFETY: both handles keep their objects live; an exclusive child
        // is confined to this thread
        unsafe { self.heap.field_store(self.obj, index, child.map(|c| c.obj)) };
    }

    pub fn get(&self, index: usize) -> Option<DynRc<'h>> {
        // SAFETY: the handle keeps the object live; the load retains the child
        unsafe { self.heap.field_load(self.obj, index) }
            .map(|obj| DynRc { heap: self.heap, obj })
    }
}

impl Clone for DynRc<'_> {
    fn clone(&self) -> Self {
        // SAFETY: live for as long as `self`
        unsafe { self.heap.retain(self.obj) };
        Self { heap: self.heap, obj: self.obj }
    }
}

impl Drop for DynRc<'_> {
    fn drop(&mut self) {
        // SAFETY: drops the count this handle owns
        unsafe { self.heap.release(self.obj) };
    }
}

/// A shared anchor: an always-atomic object whose slots are the publication
/// points between threads.
///
/// Storing a [`DynRc`] promotes its whole subgraph to atomic counting before
/// the slot write, and reading returns an independently counted handle, so
/// any number of threads may publish and consume through the same anchor.
pub struct SharedSlots<'h> {
    heap: &'h Heap,
    obj: Obj,
}

// SAFETY: the anchor is in atomic mode from birth and every slot operation
// goes through the object lock; handles read out of it are independently
// counted.
unsafe impl Send for SharedSlots<'_> {}
// SAFETY: see above
unsafe impl Sync for SharedSlots<'_> {}

impl<'h> SharedSlots<'h> {
    pub fn new(heap: &'h Heap, field_len: usize) -> Self {
        let obj = heap.allocate(field_len);
        // SAFETY: just allocated, still private to this thread
        unsafe { heap.promote_shared(obj) };
        Self { heap, obj }
    }

    pub fn obj(&self) -> Obj {
        self.obj
    }

    /// Publish `child` (or clear the slot). The child's subgraph is promoted
    /// to atomic counting before it becomes visible.
    pub fn set(&self, index: usize, child: Option<&DynRc<'h>>) {
        // SAFETY: both objects are live; an exclusive child is confined to
        // the calling thread until this store
        unsafe { self.heap.field_store(self.obj, index, child.map(|c| c.obj)) };
    }

    pub fn get(&self, index: usize) -> Option<DynRc<'h>> {
        // SAFETY: the anchor keeps itself live; the load retains the child
        unsafe { self.heap.field_load(self.obj, index) }
            .map(|obj| DynRc { heap: self.heap, obj })
    }
}

impl Drop for SharedSlots<'_> {
    fn drop(&mut self) {
        // SAFETY: drops the count this handle owns
        unsafe { self.heap.release(self.obj) };
    }
}
