use thiserror::Error;

/// Why an allocation request produced no memory.
///
/// The `GlobalAlloc` and C surfaces collapse every variant into a null pointer;
/// the distinction only exists for callers of [`Heap::allocate`](crate::Heap::allocate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("zero-sized allocation requested")]
  InvalidSize,
  #[error("allocation of {requested} bytes exceeds the {limit}-byte payload limit")]
  TooLarge { requested: usize, limit: usize },
  #[error("no free block can hold {requested} bytes")]
  OutOfMemory { requested: usize },
}

/// Failure of a [`PageProvider`](crate::PageProvider) to supply the arena.
#[derive(Debug, Error)]
pub enum ReserveError {
  #[error("mmap of {len} bytes failed: {source}")]
  Os {
    len: usize,
    #[source]
    source: std::io::Error,
  },
  #[cfg(feature = "static-backing")]
  #[error("{requested} bytes requested but the static arena holds {capacity}")]
  Exceeds { requested: usize, capacity: usize },
  #[cfg(feature = "static-backing")]
  #[error("static arena is already claimed")]
  StaticInUse,
}

/// An invariant violation found by [`Heap::check`](crate::Heap::check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapCorruption {
  #[error("block at offset {offset} has implausible size {size}")]
  BadSize { offset: usize, size: usize },
  #[error("block at offset {offset} runs past the arena end to {end}")]
  Overrun { offset: usize, end: usize },
  #[error("free list does not terminate")]
  Cycle,
  #[error("free list links around offset {offset} are not symmetric")]
  BrokenLink { offset: usize },
  #[error("free list entry at offset {offset} is not a block boundary")]
  StrayFreeBlock { offset: usize },
  #[error("free block at offset {offset} has a free physical successor")]
  AdjacentFree { offset: usize },
}
