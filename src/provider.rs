//! Sources of raw arena memory.
//!
//! The heap asks its provider for one page-aligned range the first time memory
//! is requested and hands it back when the heap itself is dropped.

use core::ptr::{NonNull, null_mut};

use crate::error::ReserveError;

/// Reserves and releases the byte range backing an arena.
pub trait PageProvider {
  /// Reserves `len` readable and writable bytes, 8-byte aligned at least.
  /// `hint` is a placement suggestion and may be null.
  fn reserve(&self, hint: *mut u8, len: usize) -> Result<NonNull<u8>, ReserveError>;

  /// Returns a range obtained from [`reserve`](Self::reserve).
  ///
  /// # Safety
  ///
  /// `addr` and `len` must be exactly what a previous `reserve` on this
  /// provider returned and was asked for, and nothing may touch the range
  /// afterwards.
  unsafe fn release_range(&self, addr: NonNull<u8>, len: usize);
}

// =============================================================================
// mmap
// =============================================================================

/// Anonymous private mappings from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapProvider;

impl MmapProvider {
  pub const fn new() -> Self {
    Self
  }
}

impl PageProvider for MmapProvider {
  fn reserve(&self, hint: *mut u8, len: usize) -> Result<NonNull<u8>, ReserveError> {
    let ptr = unsafe {
      libc::mmap(
        hint.cast(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      return Err(ReserveError::Os {
        len,
        source: std::io::Error::last_os_error(),
      });
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ReserveError::Os {
      len,
      source: std::io::Error::from(std::io::ErrorKind::AddrNotAvailable),
    })
  }

  unsafe fn release_range(&self, addr: NonNull<u8>, len: usize) {
    unsafe { libc::munmap(addr.as_ptr().cast(), len) };
  }
}

// =============================================================================
// Static backing
// =============================================================================

#[cfg(feature = "static-backing")]
pub use self::backing::StaticProvider;

#[cfg(feature = "static-backing")]
mod backing {
  use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
  };

  use super::PageProvider;
  use crate::{HEAP_SIZE, error::ReserveError};

  #[repr(C, align(4096))]
  struct StaticArena(UnsafeCell<[u8; HEAP_SIZE]>);

  // Only the heap that claimed it ever touches the buffer.
  unsafe impl Sync for StaticArena {}

  static BACKING: StaticArena = StaticArena(UnsafeCell::new([0; HEAP_SIZE]));
  static CLAIMED: AtomicBool = AtomicBool::new(false);

  /// Hands out a single `HEAP_SIZE` buffer in static storage instead of asking
  /// the OS. Only one heap may hold it at a time.
  #[derive(Debug, Default, Clone, Copy)]
  pub struct StaticProvider;

  impl StaticProvider {
    pub const fn new() -> Self {
      Self
    }
  }

  impl PageProvider for StaticProvider {
    fn reserve(&self, _hint: *mut u8, len: usize) -> Result<NonNull<u8>, ReserveError> {
      if len > HEAP_SIZE {
        return Err(ReserveError::Exceeds {
          requested: len,
          capacity: HEAP_SIZE,
        });
      }
      if CLAIMED.swap(true, Ordering::AcqRel) {
        return Err(ReserveError::StaticInUse);
      }
      Ok(NonNull::from(&BACKING.0).cast::<u8>())
    }

    unsafe fn release_range(&self, _addr: NonNull<u8>, _len: usize) {
      CLAIMED.store(false, Ordering::Release);
    }
  }
}

/// Provider used by [`Heap::new`](crate::Heap::new), chosen at build time.
#[cfg(not(feature = "static-backing"))]
pub type DefaultProvider = MmapProvider;

/// Provider used by [`Heap::new`](crate::Heap::new), chosen at build time.
#[cfg(feature = "static-backing")]
pub type DefaultProvider = StaticProvider;

/// Placement hint passed to every reservation.
pub(crate) const NO_HINT: *mut u8 = null_mut();

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mmap_reserve_is_page_aligned_and_writable() {
    let provider = MmapProvider::new();
    let ptr = provider.reserve(NO_HINT, 4096 * 2).expect("mmap should succeed");
    assert_eq!(ptr.as_ptr() as usize % 4096, 0);

    unsafe {
      ptr.as_ptr().write_bytes(0x5A, 4096 * 2);
      assert_eq!(*ptr.as_ptr().add(4096 * 2 - 1), 0x5A);
      provider.release_range(ptr, 4096 * 2);
    }
  }

  #[test]
  fn mmap_reserve_reports_os_error() {
    let err = MmapProvider::new()
      .reserve(NO_HINT, usize::MAX & !4095)
      .expect_err("reserving the whole address space must fail");
    assert!(matches!(err, ReserveError::Os { .. }));
  }

  #[cfg(feature = "static-backing")]
  #[test]
  fn static_provider_rejects_oversized_request() {
    let err = StaticProvider::new()
      .reserve(NO_HINT, crate::HEAP_SIZE + 4096)
      .expect_err("static buffer is fixed");
    assert!(matches!(err, ReserveError::Exceeds { .. }));
  }

  #[cfg(feature = "static-backing")]
  #[test]
  fn static_provider_is_claimed_once_at_a_time() {
    let provider = StaticProvider::new();
    let base = provider.reserve(NO_HINT, crate::HEAP_SIZE).expect("buffer is free");
    assert!(matches!(
      provider.reserve(NO_HINT, crate::HEAP_SIZE),
      Err(ReserveError::StaticInUse)
    ));
    unsafe { provider.release_range(base, crate::HEAP_SIZE) };
    let again = provider.reserve(NO_HINT, crate::HEAP_SIZE).expect("buffer was handed back");
    unsafe { provider.release_range(again, crate::HEAP_SIZE) };
  }
}
