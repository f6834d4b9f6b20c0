//! Hybrid memory management: reference counting with dynamic atomicity plus
//! a concurrent partial mark-and-sweep cycle collector.
//!
//! Heap objects are headers followed by nullable owning slots; the object
//! graph may be cyclic. Counts start non-atomic and switch to atomic
//! maintenance, transitively, the moment an object is published to another
//! thread. Cyclic garbage is found by a collector pass that drains a buffer
//! of suspected cycle roots and runs a locked four-color partial scan while
//! mutators keep going.
//!
//! This crate layers safe handle types over the unsafe core in [`heap`]:
//!
//! - [`ManualRef`] — uncounted baseline with explicit teardown
//! - [`LocalRc`] — single-thread counting, never atomic
//! - [`SyncRc`] — atomic counting from birth, freely shareable
//! - [`DynRc`] — starts non-atomic, promoted when published
//! - [`SharedSlots`] — the cross-thread publication anchor for [`DynRc`]

mod handles;

pub use handles::{DynRc, LocalRc, ManualRef, SharedSlots, SyncRc};
pub use heap::Heap;
pub use object::{Header, HeaderFlags, Obj, SpinLock, SpinLockGuard};
