//! Arena memory and the block headers living inside it.
//!
//! ```text
//!   heap_start                                             heap_start + len
//!   ┌────────┬──────────────┬────────┬───────────┬────────┬───────────────┐
//!   │ header │   payload    │ header │  payload  │ header │   payload     │
//!   └────────┴──────────────┴────────┴───────────┴────────┴───────────────┘
//!   ▲ Block(0)              ▲ Block(0 + size)    ▲ ...
//! ```
//!
//! Blocks are addressed by their byte offset from the arena base. Every header
//! access goes through [`Arena`], which checks that the offset names an aligned
//! header fully inside the arena.

use core::{mem::size_of, ptr::NonNull};

use crate::ALIGN;

/// Block metadata. `prev` and `next` are only meaningful while the block is
/// free; once allocated they belong to the caller's payload.
#[repr(C, align(8))]
struct Header {
  size: usize,
  prev: usize,
  next: usize,
}

/// Bytes of metadata in front of every payload.
pub const HEADER_SIZE: usize = size_of::<Header>();

const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(ALIGN.is_power_of_two());

/// Link value for "no block".
const NIL: usize = usize::MAX;

/// Offset of a block header from the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Block(usize);

impl Block {
  /// The block every arena starts with.
  pub(crate) const ORIGIN: Self = Self(0);

  pub(crate) const fn at(offset: usize) -> Self {
    Self(offset)
  }

  pub(crate) const fn offset(self) -> usize {
    self.0
  }

  fn encode(link: Option<Self>) -> usize {
    link.map_or(NIL, |b| b.0)
  }

  fn decode(raw: usize) -> Option<Self> {
    (raw != NIL).then_some(Self(raw))
  }
}

/// The contiguous range backing one heap.
pub(crate) struct Arena {
  base: NonNull<u8>,
  len: usize,
}

impl Arena {
  /// Takes ownership of `base..base + len` and formats it as one free block.
  ///
  /// # Safety
  ///
  /// The range must be valid for reads and writes, exclusive to the returned
  /// arena, and outlive it.
  pub(crate) unsafe fn format(base: NonNull<u8>, len: usize) -> Self {
    assert!(base.as_ptr().addr() % ALIGN == 0, "arena base must be aligned");
    assert!(len % ALIGN == 0 && len >= 2 * HEADER_SIZE, "arena too small");

    let arena = Self { base, len };
    arena.write_header(Block::ORIGIN, len, None, None);
    arena
  }

  pub(crate) const fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub(crate) const fn len(&self) -> usize {
    self.len
  }

  /// Whether a header could live at `offset`.
  pub(crate) fn holds_header(&self, offset: usize) -> bool {
    offset % ALIGN == 0 && offset.checked_add(HEADER_SIZE).is_some_and(|end| end <= self.len)
  }

  fn header(&self, block: Block) -> *mut Header {
    assert!(
      self.holds_header(block.0),
      "header access at offset {} outside arena of {} bytes",
      block.0,
      self.len
    );
    unsafe { self.base.as_ptr().add(block.0).cast::<Header>() }
  }

  pub(crate) fn write_header(&self, block: Block, size: usize, prev: Option<Block>, next: Option<Block>) {
    let header = self.header(block);
    unsafe {
      header.write(Header {
        size,
        prev: Block::encode(prev),
        next: Block::encode(next),
      });
    }
  }

  pub(crate) fn size(&self, block: Block) -> usize {
    unsafe { (*self.header(block)).size }
  }

  pub(crate) fn set_size(&self, block: Block, size: usize) {
    unsafe { (*self.header(block)).size = size };
  }

  pub(crate) fn prev(&self, block: Block) -> Option<Block> {
    Block::decode(unsafe { (*self.header(block)).prev })
  }

  pub(crate) fn next(&self, block: Block) -> Option<Block> {
    Block::decode(unsafe { (*self.header(block)).next })
  }

  pub(crate) fn set_prev(&self, block: Block, prev: Option<Block>) {
    unsafe { (*self.header(block)).prev = Block::encode(prev) };
  }

  pub(crate) fn set_next(&self, block: Block, next: Option<Block>) {
    unsafe { (*self.header(block)).next = Block::encode(next) };
  }

  /// Offset one past the last byte of `block`.
  pub(crate) fn end(&self, block: Block) -> usize {
    block.0 + self.size(block)
  }

  /// Address handed to callers for `block`.
  pub(crate) fn payload(&self, block: Block) -> NonNull<u8> {
    let header = self.header(block);
    unsafe { NonNull::new_unchecked(header.cast::<u8>().add(HEADER_SIZE)) }
  }

  /// Header offset a payload pointer would belong to. Rejects anything whose
  /// header is not an aligned in-bounds location.
  pub(crate) fn block_of(&self, ptr: *mut u8) -> Option<Block> {
    let offset = ptr
      .addr()
      .checked_sub(self.base.as_ptr().addr())?
      .checked_sub(HEADER_SIZE)?;
    self.holds_header(offset).then_some(Block(offset))
  }

  /// Walks the tiling from the arena start. Stops early at the first header
  /// whose size cannot be right.
  pub(crate) fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
    core::iter::successors(Some(Block::ORIGIN), move |&block| {
      let size = self.size(block);
      let next = block.0.checked_add(size)?;
      (size >= HEADER_SIZE && size % ALIGN == 0 && next < self.len && self.holds_header(next))
        .then_some(Block(next))
    })
  }

  /// Whether `block` is the start of a real block, found by walking sizes
  /// from `heap_start`.
  pub(crate) fn is_boundary(&self, block: Block) -> bool {
    self
      .blocks()
      .take_while(|b| b.0 <= block.0)
      .any(|b| b == block)
  }
}
