//! The allocator context: one lazily reserved arena, a free list behind a
//! single lock, and an attempt counter.
//!
//! ```text
//!   allocate / release
//!          │
//!          ▼
//!   initialized? ──no──► init lock ──► re-check ──► provider.reserve ──► format
//!          │yes                                                          │
//!          ▼◄────────────────────────────────────────────────────────────┘
//!   allocator lock ──► free list (first fit + split | validate + coalesce)
//! ```
//!
//! Both locks spin. The allocator lock covers the entire body of every
//! allocation and release, so callers observe a total order of operations.

use core::{
  cell::UnsafeCell,
  ptr::NonNull,
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use log::{debug, trace, warn};
use spin::Mutex;

use crate::{
  ALIGN, PAGE_SIZE,
  arena::{Arena, Block, HEADER_SIZE},
  error::{AllocError, HeapCorruption},
  free_list::FreeList,
  provider::{DefaultProvider, NO_HINT, PageProvider},
};

/// Snapshot of the free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

/// What a release call ended up doing. Never surfaced through the public
/// release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
  Null,
  Freed { merges: usize },
  AlreadyFree,
  Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
  Uninitialized,
  OutOfBounds,
  Misaligned,
  ImplausibleSize,
  NotABlock,
}

/// A first-fit free-list heap over one fixed-size arena.
pub struct Heap<P: PageProvider = DefaultProvider> {
  provider: P,
  size: usize,
  initialized: AtomicBool,
  init_lock: Mutex<()>,
  /// Written once under `init_lock` before `initialized` is published.
  arena: UnsafeCell<Option<Arena>>,
  free: Mutex<FreeList>,
  allocations: AtomicUsize,
}

unsafe impl<P: PageProvider + Sync> Sync for Heap<P> {}
unsafe impl<P: PageProvider + Send> Send for Heap<P> {}

impl Heap<DefaultProvider> {
  /// A heap of `size` bytes (rounded up to whole pages) backed by the build's
  /// default provider. Nothing is reserved until the first allocation.
  pub const fn new(size: usize) -> Self {
    Self::with_provider(DefaultProvider::new(), size)
  }
}

impl<P: PageProvider> Heap<P> {
  pub const fn with_provider(provider: P, size: usize) -> Self {
    Self {
      provider,
      size: arena_len(size),
      initialized: AtomicBool::new(false),
      init_lock: Mutex::new(()),
      arena: UnsafeCell::new(None),
      free: Mutex::new(FreeList::new()),
      allocations: AtomicUsize::new(0),
    }
  }

  /// Total arena length in bytes, headers included.
  pub const fn heap_size(&self) -> usize {
    self.size
  }

  /// Largest request that can ever succeed.
  pub const fn max_request(&self) -> usize {
    self.size - HEADER_SIZE
  }

  pub fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::Acquire)
  }

  /// Number of `allocate` calls so far, failed ones included.
  pub fn allocation_count(&self) -> usize {
    self.allocations.load(Ordering::Relaxed)
  }

  /// Allocates `size` bytes aligned to 8.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.allocations.fetch_add(1, Ordering::Relaxed);

    let payload = self.payload_size(size)?;
    let arena = self.arena().ok_or(AllocError::OutOfMemory { requested: size })?;

    let block = self
      .free
      .lock()
      .take(arena, payload)
      .ok_or(AllocError::OutOfMemory { requested: size })?;
    Ok(arena.payload(block))
  }

  /// Returns memory obtained from [`allocate`](Self::allocate).
  ///
  /// Null, pointers this heap never handed out, and blocks that are already
  /// free are ignored.
  ///
  /// # Safety
  ///
  /// If `ptr` is a live allocation from this heap, nothing may access it after
  /// this call.
  pub unsafe fn release(&self, ptr: *mut u8) {
    match self.release_inner(ptr) {
      Release::Null | Release::Freed { .. } => {}
      Release::AlreadyFree => trace!("ignoring release of already free block {ptr:p}"),
      Release::Rejected(reason) => trace!("ignoring release of {ptr:p}: {reason:?}"),
    }
  }

  pub(crate) fn release_inner(&self, ptr: *mut u8) -> Release {
    if ptr.is_null() {
      return Release::Null;
    }
    let Some(arena) = self.initialized_arena() else {
      return Release::Rejected(Rejection::Uninitialized);
    };

    let mut free = self.free.lock();
    let block = match validate(arena, ptr) {
      Ok(block) => block,
      Err(reason) => return Release::Rejected(reason),
    };
    if free.contains(arena, block) {
      return Release::AlreadyFree;
    }
    let merges = free.release(arena, block);
    Release::Freed { merges }
  }

  /// Free-list summary, or `None` before the arena exists.
  pub fn stats(&self) -> Option<HeapStats> {
    let arena = self.initialized_arena()?;
    let free = self.free.lock();
    Some(free.iter(arena).fold(HeapStats::default(), |stats, block| {
      let size = arena.size(block);
      HeapStats {
        free_blocks: stats.free_blocks + 1,
        free_bytes: stats.free_bytes + size,
        largest_free: stats.largest_free.max(size),
      }
    }))
  }

  /// Verifies the block tiling and the free list against each other.
  pub fn check(&self) -> Result<(), HeapCorruption> {
    let Some(arena) = self.initialized_arena() else {
      return Ok(());
    };
    let free = self.free.lock();
    check_arena(arena, &free)
  }

  /// Rounds a request up to the alignment, rejecting what cannot fit.
  fn payload_size(&self, size: usize) -> Result<usize, AllocError> {
    if size == 0 {
      return Err(AllocError::InvalidSize);
    }
    let too_large = AllocError::TooLarge {
      requested: size,
      limit: self.max_request(),
    };
    let payload = size.checked_next_multiple_of(ALIGN).ok_or(too_large)?;
    match payload.checked_add(HEADER_SIZE) {
      Some(total) if total <= self.size => Ok(payload),
      _ => Err(too_large),
    }
  }

  fn initialized_arena(&self) -> Option<&Arena> {
    if !self.initialized.load(Ordering::Acquire) {
      return None;
    }
    unsafe { (*self.arena.get()).as_ref() }
  }

  /// The arena, reserving and formatting it on first use.
  fn arena(&self) -> Option<&Arena> {
    if let Some(arena) = self.initialized_arena() {
      return Some(arena);
    }
    self.initialize();
    self.initialized_arena()
  }

  #[cold]
  fn initialize(&self) {
    let reserved = {
      let _guard = self.init_lock.lock();
      if self.initialized.load(Ordering::Acquire) {
        return;
      }
      self.provider.reserve(NO_HINT, self.size).map(|base| {
        let arena = unsafe { Arena::format(base, self.size) };
        unsafe { *self.arena.get() = Some(arena) };
        self.initialized.store(true, Ordering::Release);
        base
      })
    };

    match reserved {
      Ok(base) => debug!("heap arena of {} bytes at {:p}", self.size, base),
      Err(err) => warn!("heap arena unavailable: {err}"),
    }
  }
}

impl<P: PageProvider> Drop for Heap<P> {
  fn drop(&mut self) {
    if let Some(arena) = self.arena.get_mut().take() {
      unsafe { self.provider.release_range(arena.base(), arena.len()) };
    }
  }
}

/// Page-rounded arena length for a requested heap size.
const fn arena_len(size: usize) -> usize {
  const LIMIT: usize = (isize::MAX as usize) & !(PAGE_SIZE - 1);
  if size == 0 {
    PAGE_SIZE
  } else if size > LIMIT {
    LIMIT
  } else {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
  }
}

/// Maps a caller pointer back to the block it was carved from, or says why it
/// cannot be one.
fn validate(arena: &Arena, ptr: *mut u8) -> Result<Block, Rejection> {
  let base = arena.base().as_ptr().addr();
  let header = ptr.addr().wrapping_sub(HEADER_SIZE);
  if ptr.addr() < base + HEADER_SIZE || header - base + HEADER_SIZE > arena.len() {
    return Err(Rejection::OutOfBounds);
  }
  if header % ALIGN != 0 {
    return Err(Rejection::Misaligned);
  }
  let block = arena.block_of(ptr).ok_or(Rejection::OutOfBounds)?;
  // Only real block starts are read; anything else may be live payload.
  if !arena.is_boundary(block) {
    return Err(Rejection::NotABlock);
  }
  let size = arena.size(block);
  if size == 0 || size > arena.len() || block.offset() + size > arena.len() {
    return Err(Rejection::ImplausibleSize);
  }
  Ok(block)
}

/// Runs without allocating: it is called with the allocator lock held, and
/// the heap may be serving the global allocator.
fn check_arena(arena: &Arena, free: &FreeList) -> Result<(), HeapCorruption> {
  // More entries than minimal blocks can only mean a cycle.
  let max_blocks = arena.len() / HEADER_SIZE;
  let mut listed = 0;
  let mut prev = None;
  for block in free.iter(arena) {
    if listed > max_blocks {
      return Err(HeapCorruption::Cycle);
    }
    if arena.prev(block) != prev {
      return Err(HeapCorruption::BrokenLink {
        offset: block.offset(),
      });
    }
    if !arena.is_boundary(block) {
      return Err(HeapCorruption::StrayFreeBlock {
        offset: block.offset(),
      });
    }
    listed += 1;
    prev = Some(block);
  }

  let mut offset = 0;
  let mut previous_free = false;
  while offset < arena.len() {
    if !arena.holds_header(offset) {
      return Err(HeapCorruption::Overrun {
        offset,
        end: offset + HEADER_SIZE,
      });
    }
    let block = Block::at(offset);
    let size = arena.size(block);
    if size < HEADER_SIZE || size % ALIGN != 0 || size > arena.len() {
      return Err(HeapCorruption::BadSize { offset, size });
    }
    let end = offset + size;
    if end > arena.len() {
      return Err(HeapCorruption::Overrun { offset, end });
    }

    let is_free = free.contains(arena, block);
    if is_free && previous_free {
      return Err(HeapCorruption::AdjacentFree { offset });
    }
    previous_free = is_free;
    offset = end;
  }
  Ok(())
}
