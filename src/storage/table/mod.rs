mod heap;
mod iterator;

pub use heap::{TableHeap, TableHeapError};
pub use iterator::TableIterator;
