//! Concurrent partial mark-and-sweep over suspected cycle roots.
//!
//! A pass drains the suspect buffer and examines each root while mutators
//! keep running; synchronization is per object, through the spin lock in the
//! header. Everything reachable from a root is locked for the duration of
//! its scan, then a four-color marking decides the root's fate: red records
//! lock acquisition, gray/white/black perform the count-subtraction
//! reachability test of Bacon and Rajan's partial scan. A white member has
//! no references from outside the scanned subgraph and can be reclaimed; a
//! root that cannot be proven unreachable is re-queued for the next pass.

use std::collections::HashMap;
use std::mem;

use object::Obj;

use crate::heap::{Heap, ObjSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Visited and locked.
    Red,
    /// Counted; the `counts` entry holds references minus scanned in-edges.
    Gray,
    /// No references left from outside the scanned subgraph.
    White,
    /// Externally referenced, along with everything reachable from it.
    Black,
}

type ObjMap<V> = HashMap<Obj, V, ahash::RandomState>;

/// Scratch state for scanning a single root.
#[derive(Default)]
struct Scan {
    colors: ObjMap<Color>,
    counts: ObjMap<usize>,
    /// Lock-acquisition order; every member stays locked until the scan of
    /// this root ends.
    visited: Vec<Obj>,
    /// Whether some edge led back to the root.
    cycle_found: bool,
}

impl Heap {
    /// Run one collection pass: drain the suspect buffer, scan each root,
    /// free what is provably unreachable and re-queue the rest.
    ///
    /// At most one pass runs at a time; mutators are never stopped.
    pub fn collect(&self) {
        let _pass = self.collect_lock.lock();
        let _span = tracing::span!(tracing::Level::TRACE, "collect").entered();

        let mut roots = mem::take(&mut *self.suspects.lock());
        let mut release_set = ObjSet::default();

        for &root in &roots {
            let mut scan = Scan::default();
            // SAFETY: buffered objects stay live until this pass frees them,
            // and the locked path above each visited object pins the rest.
            unsafe { mark_red(root, root, &mut scan) };

            if scan.cycle_found {
                // SAFETY: every scanned object is locked
                unsafe {
                    mark_gray(root, &mut scan, true);
                    mark_white_or_black(root, &mut scan);
                }
                for &obj in &scan.visited {
                    if scan.colors[&obj] == Color::White {
                        // SAFETY: locked member of the scanned subgraph
                        unsafe { obj.header().mark_for_sweep() };
                        release_set.insert(obj);
                    }
                }
                for &obj in &scan.visited {
                    // SAFETY: locked in mark_red
                    unsafe { obj.header().unlock() };
                }
            } else {
                for &obj in &scan.visited {
                    // SAFETY: locked in mark_red
                    unsafe { obj.header().unlock() };
                }
                // Not part of a cycle: reclaimable only if a mutator already
                // tore down the root and everything below it.
                let mut subgraph = ObjSet::default();
                // SAFETY: same liveness argument as mark_red
                if unsafe { sweep_ready(root, &mut subgraph) } {
                    release_set.extend(subgraph);
                }
            }
        }

        // Unlink released objects from surviving neighbors while their
        // storage is still valid, then free. Two passes: edges between
        // release-set members must stay dereferenceable until every member
        // has been unlinked.
        for &obj in &release_set {
            roots.remove(&obj);
            // SAFETY: still allocated; freed in the next pass
            unsafe {
                let header = obj.header();
                if header.is_cyclic() && header.is_buffered() {
                    self.suspects.lock().remove(&obj);
                    header.clear_buffered();
                }
                for index in 0..header.field_len() {
                    let Some(child) = obj.field(index) else { continue };
                    if !child.header().is_marked_for_sweep() {
                        // A surviving neighbor loses this edge through the
                        // ordinary release path, cascading if it was the
                        // neighbor's last reference.
                        self.release(child);
                    }
                }
            }
        }
        let released = release_set.len();
        for &obj in &release_set {
            // SAFETY: unlinked above and unreachable from any mutator
            unsafe { self.free(obj) };
        }

        // Whatever could not be proven unreachable goes back for the next
        // pass; the objects keep their buffered bit, so membership and flag
        // stay in agreement.
        let requeued = roots.len();
        if requeued > 0 {
            let mut suspects = self.suspects.lock();
            for &root in &roots {
                suspects.insert(root);
            }
        }
        tracing::trace!(released, requeued, "collection pass finished");
    }
}

/// Lock and color every object reachable from `root` in DFS order. An edge
/// pointing back at `root` flags it as part of a cycle; self-loops count.
///
/// # Safety
///
/// `root` must be live. Liveness of everything below follows: the locked
/// path above each object pins the counts along its edges.
unsafe fn mark_red(root: Obj, current: Obj, scan: &mut Scan) {
    if scan.colors.contains_key(&current) {
        return;
    }
    scan.colors.insert(current, Color::Red);
    // SAFETY: slot reads happen under the object's lock
    unsafe {
        let header = current.header();
        header.lock();
        scan.visited.push(current);
        for index in 0..header.field_len() {
            let Some(child) = current.field(index) else { continue };
            if child == root {
                scan.cycle_found = true;
            }
            mark_red(root, child, scan);
        }
    }
}

/// Subtract every in-edge inside the subgraph from each member's count. The
/// root keeps its full count; a node first reached through an edge starts at
/// count − 1 and loses one more for every further edge that lands on it, so
/// parallel edges to one child are each accounted for.
///
/// # Safety
///
/// Every object reachable from `current` is locked by the red phase.
unsafe fn mark_gray(current: Obj, scan: &mut Scan, is_root: bool) {
    if scan.colors.get(&current) == Some(&Color::Gray) {
        let count = scan.counts.get_mut(&current).expect("gray node has a count");
        debug_assert!(*count > 0, "scan count underflow");
        *count -= 1;
        return;
    }
    scan.colors.insert(current, Color::Gray);
    // SAFETY: locked by the red phase
    unsafe {
        let refs = current.header().strong_acquire();
        scan.counts.insert(current, if is_root { refs } else { refs - 1 });
        for index in 0..current.field_len() {
            if let Some(child) = current.field(index) {
                mark_gray(child, scan, false);
            }
        }
    }
}

/// Decide white or black for each gray node. A remaining count of zero means
/// no external references: the node is white and its fields are examined in
/// turn. A positive count turns it black, and blackness floods everything
/// reachable from it, repainting white nodes where necessary.
///
/// # Safety
///
/// Every object reachable from `current` is locked by the red phase.
unsafe fn mark_white_or_black(current: Obj, scan: &mut Scan) {
    if scan.colors.get(&current) != Some(&Color::Gray) {
        return;
    }
    if scan.counts[&current] != 0 {
        // SAFETY: same contract
        unsafe { mark_black(current, scan) };
        return;
    }
    scan.colors.insert(current, Color::White);
    // SAFETY: locked by the red phase
    unsafe {
        for index in 0..current.field_len() {
            if let Some(child) = current.field(index) {
                mark_white_or_black(child, scan);
            }
        }
    }
}

/// # Safety
///
/// Every object reachable from `current` is locked by the red phase.
unsafe fn mark_black(current: Obj, scan: &mut Scan) {
    if scan.colors.get(&current) == Some(&Color::Black) {
        return;
    }
    scan.colors.insert(current, Color::Black);
    // SAFETY: locked by the red phase
    unsafe {
        for index in 0..current.field_len() {
            if let Some(child) = current.field(index) {
                mark_black(child, scan);
            }
        }
    }
}

/// Verify that a mutator already tore down `current` and every object below
/// it, collecting the subgraph into `out`. Anything short of a full pass
/// means live references remain and the caller discards the set.
///
/// # Safety
///
/// `current` must be live; children are pinned by their parents' edges while
/// the parent's lock is held.
unsafe fn sweep_ready(current: Obj, out: &mut ObjSet) -> bool {
    if out.contains(&current) {
        return true;
    }
    // SAFETY: per contract; slot reads under the object's lock
    unsafe {
        let header = current.header();
        if !header.is_marked_for_sweep() {
            return false;
        }
        out.insert(current);
        header.lock();
        for index in 0..header.field_len() {
            let Some(child) = current.field(index) else { continue };
            if !sweep_ready(child, out) {
                header.unlock();
                return false;
            }
        }
        header.unlock();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocate a cyclic-typed object with two slots.
    fn cyclic(heap: &Heap) -> Obj {
        let obj = heap.allocate(2);
        // SAFETY: just allocated, thread-local
        unsafe { heap.mark_cyclic(obj) };
        obj
    }

    /// `a.fields[index] = b` plus the count bookkeeping, dropping nothing.
    fn link(heap: &Heap, a: Obj, index: usize, b: Obj) {
        // SAFETY: both objects are live in every caller
        unsafe { heap.field_store(a, index, Some(b)) };
    }

    #[test]
    fn pass_over_empty_buffer_is_a_noop() {
        let heap = Heap::new();
        heap.collect();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn two_object_cycle_is_reclaimed() {
        let heap = Heap::new();
        let a = cyclic(&heap);
        let b = cyclic(&heap);
        link(&heap, a, 0, b);
        link(&heap, b, 0, a);

        // Drop the external handles; both decrements land on one.
        unsafe {
            heap.release(a);
            heap.release(b);
        }
        assert_eq!(heap.suspects.lock().len(), 2);
        assert_eq!(heap.live_objects(), 2);

        heap.collect();
        assert_eq!(heap.live_objects(), 0, "the cycle should be collected");
        assert!(heap.suspects.lock().is_empty());
    }

    #[test]
    fn self_loop_is_reclaimed() {
        let heap = Heap::new();
        let obj = cyclic(&heap);
        link(&heap, obj, 0, obj);

        unsafe { heap.release(obj) };
        assert_eq!(heap.live_objects(), 1);

        heap.collect();
        assert_eq!(heap.live_objects(), 0, "a self-loop is a one-object cycle");
    }

    #[test]
    fn cycle_with_external_reference_survives() {
        let heap = Heap::new();
        let a = cyclic(&heap);
        let b = cyclic(&heap);
        let c = cyclic(&heap);
        link(&heap, a, 0, b);
        link(&heap, b, 0, c);
        link(&heap, c, 0, a);

        // Keep the handle on `a`; drop the other two.
        unsafe {
            heap.release(b);
            heap.release(c);
        }

        heap.collect();
        assert_eq!(heap.live_objects(), 3, "externally referenced cycle must survive");
        assert_eq!(
            heap.suspects.lock().len(),
            2,
            "unproven roots should be re-queued"
        );

        // A second pass without mutation frees nothing either.
        heap.collect();
        assert_eq!(heap.live_objects(), 3);

        unsafe { heap.release(a) };
        heap.collect();
        assert_eq!(heap.live_objects(), 0, "cycle should go once the external ref does");
        assert!(heap.suspects.lock().is_empty());
    }

    #[test]
    fn cycle_releases_its_acyclic_leaf() {
        let heap = Heap::new();
        let a = cyclic(&heap);
        let b = cyclic(&heap);
        let leaf = heap.allocate(0);
        link(&heap, a, 0, b);
        link(&heap, b, 0, a);
        link(&heap, a, 1, leaf);

        unsafe {
            heap.release(leaf);
            heap.release(a);
            heap.release(b);
        }
        assert_eq!(heap.live_objects(), 3);

        heap.collect();
        assert_eq!(
            heap.live_objects(),
            0,
            "finalizing the cycle should release the leaf as well"
        );
    }

    #[test]
    fn dead_chain_into_a_cycle_is_fully_reclaimed() {
        let heap = Heap::new();
        let z1 = cyclic(&heap);
        let z2 = cyclic(&heap);
        link(&heap, z1, 0, z2);
        link(&heap, z2, 0, z1);

        let head = cyclic(&heap);
        link(&heap, head, 0, z1);

        unsafe {
            heap.release(z1);
            heap.release(z2);
            heap.release(head);
        }
        assert_eq!(heap.live_objects(), 3);

        for _ in 0..4 {
            heap.collect();
            if heap.live_objects() == 0 {
                break;
            }
        }
        assert_eq!(heap.live_objects(), 0, "chain and cycle should both go");
    }

    #[test]
    fn repeated_passes_are_idempotent() {
        let heap = Heap::new();
        let a = cyclic(&heap);
        let b = cyclic(&heap);
        link(&heap, a, 0, b);
        link(&heap, b, 0, a);
        unsafe {
            heap.release(a);
            heap.release(b);
        }

        heap.collect();
        let after_first = heap.live_objects();
        heap.collect();
        assert_eq!(
            heap.live_objects(),
            after_first,
            "a pass with no intervening mutation frees nothing"
        );
        assert_eq!(after_first, 0);
    }

    #[test]
    fn zero_field_cyclic_object_is_reclaimed() {
        let heap = Heap::new();
        let obj = heap.allocate(0);
        unsafe {
            heap.mark_cyclic(obj);
            heap.retain(obj);
            heap.release(obj);
            heap.release(obj);
        }

        // No cycle scan is possible with no fields; the carcass goes through
        // the sweep-verification path.
        heap.collect();
        assert_eq!(heap.live_objects(), 0);
        assert!(heap.suspects.lock().is_empty());
    }

    #[test]
    fn parallel_edges_are_counted_per_edge() {
        let heap = Heap::new();
        let a = cyclic(&heap);
        let b = cyclic(&heap);
        link(&heap, a, 0, b);
        link(&heap, a, 1, b);
        link(&heap, b, 0, a);

        unsafe {
            heap.release(a);
            heap.release(b);
        }

        heap.collect();
        assert_eq!(
            heap.live_objects(),
            0,
            "both edges into b must be subtracted during the gray phase"
        );
    }
}
