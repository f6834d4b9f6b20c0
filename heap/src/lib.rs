mod collector;
mod heap;

pub use heap::{Heap, HeapInner, ObjSet};
