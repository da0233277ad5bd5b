//! A first-fit, explicit free-list heap over a single fixed-size arena.
//!
//! The arena is reserved lazily on the first allocation, either from the OS
//! with `mmap` or, with the `static-backing` feature, from a buffer in static
//! storage. Every block starts with a header recording its size; free blocks
//! additionally link into a doubly linked list. Allocation takes the first
//! free block that fits and splits off the remainder; release validates the
//! pointer, ignores double frees, and eagerly coalesces with both physical
//! neighbors. One spinning lock serializes every allocation and release.
//!
//! ```rust
//! use freeheap::{HEAP_SIZE, Heap};
//!
//! let heap = Heap::new(HEAP_SIZE);
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 8, 0);
//! unsafe { heap.release(ptr.as_ptr()) };
//! ```
//!
//! The process-wide instance behind [`heap_malloc`], [`heap_free`] and
//! [`Allocator`] holds [`HEAP_SIZE`] bytes and is never returned to the OS.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::null_mut,
};

mod arena;
mod error;
mod free_list;
mod heap;
mod provider;

pub use arena::HEADER_SIZE;
pub use error::{AllocError, HeapCorruption, ReserveError};
pub use heap::{Heap, HeapStats};
#[cfg(feature = "static-backing")]
pub use provider::StaticProvider;
pub use provider::{DefaultProvider, MmapProvider, PageProvider};

// =============================================================================
// Constants
// =============================================================================

/// Arena size of the process-wide heap.
pub const HEAP_SIZE: usize = 4096 * 10;

/// Alignment of every block boundary and returned pointer.
pub const ALIGN: usize = 8;

/// Granule arena lengths are rounded up to.
pub const PAGE_SIZE: usize = 4096;

const _: () = assert!(HEAP_SIZE % PAGE_SIZE == 0);

static HEAP: Heap = Heap::new(HEAP_SIZE);

// =============================================================================
// Process-wide heap
// =============================================================================

/// Allocates from the process-wide heap. Null on any failure.
pub fn heap_malloc(size: usize) -> *mut u8 {
  HEAP.allocate(size).map_or(null_mut(), |ptr| ptr.as_ptr())
}

/// Releases to the process-wide heap. Null, foreign and already free pointers
/// are ignored.
///
/// # Safety
///
/// If `ptr` is a live allocation, nothing may access it after this call.
pub unsafe fn heap_free(ptr: *mut u8) {
  unsafe { HEAP.release(ptr) }
}

/// Allocation attempts made against the process-wide heap.
pub fn malloc_count() -> usize {
  HEAP.allocation_count()
}

/// The process-wide heap itself, for diagnostics.
pub fn global_heap() -> &'static Heap {
  &HEAP
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Routes Rust allocations to the process-wide heap.
///
/// Only alignments up to [`ALIGN`] are served; stricter layouts get null.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGN {
      return null_mut();
    }
    heap_malloc(layout.size().max(1))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { heap_free(ptr) }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================
//
// Meant for C programs that link the staticlib and call only these three.
// There is no realloc: interposing the cdylib with LD_PRELOAD would route
// this heap's pointers into libc's realloc, which corrupts both heaps.

/// `malloc` over the process-wide heap. Not a drop-in libc replacement: see
/// the note on this section about `realloc`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  heap_malloc(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { heap_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = heap_malloc(total);
  if !ptr.is_null() {
    unsafe { ptr.write_bytes(0, total) };
  }
  ptr
}
