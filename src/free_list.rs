//! Doubly linked list of free blocks, threaded through their headers.
//!
//! Neighbors for insertion and coalescing are found by scanning the whole list
//! and picking the physically closest free block on each side, so the result
//! does not depend on list order. Insertion splices the block in between those
//! neighbors, which keeps the list in address order as a side effect.

use crate::arena::{Arena, Block, HEADER_SIZE};

pub(crate) struct FreeList {
  head: Option<Block>,
}

impl FreeList {
  /// The list of a freshly formatted arena: one block covering everything.
  pub(crate) const fn new() -> Self {
    Self {
      head: Some(Block::ORIGIN),
    }
  }

  pub(crate) fn iter<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = Block> + 'a {
    core::iter::successors(self.head, move |&block| arena.next(block))
  }

  /// First block large enough for `payload` bytes plus a header.
  fn find_fit(&self, arena: &Arena, payload: usize) -> Option<Block> {
    let needed = payload + HEADER_SIZE;
    self.iter(arena).find(|&block| arena.size(block) >= needed)
  }

  /// Carves a block for `payload` bytes out of the first fit and removes it
  /// from the list. `payload` must already be a multiple of the alignment.
  pub(crate) fn take(&mut self, arena: &Arena, payload: usize) -> Option<Block> {
    let block = self.find_fit(arena, payload)?;
    let size = arena.size(block);
    let needed = payload + HEADER_SIZE;

    if size > payload + 2 * HEADER_SIZE {
      // Remainder keeps the original's place in the list.
      let rest = Block::at(block.offset() + needed);
      arena.write_header(rest, size - needed, arena.prev(block), arena.next(block));
      self.relink(arena, rest);
      arena.set_size(block, needed);
    } else {
      self.unlink(arena, block);
    }

    arena.set_prev(block, None);
    arena.set_next(block, None);
    Some(block)
  }

  pub(crate) fn contains(&self, arena: &Arena, block: Block) -> bool {
    self.iter(arena).any(|free| free == block)
  }

  /// Closest free block ending at or before `block` starts.
  fn lower_neighbor(&self, arena: &Arena, block: Block) -> Option<Block> {
    self
      .iter(arena)
      .filter(|&free| arena.end(free) <= block.offset())
      .max_by_key(|free| free.offset())
  }

  /// Closest free block starting at or after `block` ends.
  fn higher_neighbor(&self, arena: &Arena, block: Block) -> Option<Block> {
    let end = arena.end(block);
    self
      .iter(arena)
      .filter(|&free| free.offset() >= end)
      .min_by_key(|free| free.offset())
  }

  /// Returns an allocated block to the list and merges it with physically
  /// adjacent free blocks. Reports how many merges happened (0..=2).
  pub(crate) fn release(&mut self, arena: &Arena, block: Block) -> usize {
    let lower = self.lower_neighbor(arena, block);
    let higher = self.higher_neighbor(arena, block);
    self.insert(arena, block, lower, higher);

    let mut merges = 0;
    let mut merged = block;
    if let Some(lower) = lower
      && arena.end(lower) == block.offset()
    {
      self.absorb(arena, lower, block);
      merged = lower;
      merges += 1;
    }
    if let Some(higher) = higher
      && arena.end(merged) == higher.offset()
    {
      self.absorb(arena, merged, higher);
      merges += 1;
    }
    merges
  }

  fn insert(&mut self, arena: &Arena, block: Block, lower: Option<Block>, higher: Option<Block>) {
    match (lower, higher) {
      (Some(lower), _) => {
        let next = arena.next(lower);
        arena.set_prev(block, Some(lower));
        arena.set_next(block, next);
        arena.set_next(lower, Some(block));
        if let Some(next) = next {
          arena.set_prev(next, Some(block));
        }
      }
      (None, Some(higher)) => {
        let prev = arena.prev(higher);
        arena.set_prev(block, prev);
        arena.set_next(block, Some(higher));
        arena.set_prev(higher, Some(block));
        match prev {
          Some(prev) => arena.set_next(prev, Some(block)),
          None => self.head = Some(block),
        }
      }
      (None, None) => {
        arena.set_prev(block, None);
        arena.set_next(block, self.head);
        if let Some(head) = self.head {
          arena.set_prev(head, Some(block));
        }
        self.head = Some(block);
      }
    }
  }

  /// Folds `upper` into the physically preceding `lower`.
  fn absorb(&mut self, arena: &Arena, lower: Block, upper: Block) {
    self.unlink(arena, upper);
    arena.set_size(lower, arena.size(lower) + arena.size(upper));
  }

  fn unlink(&mut self, arena: &Arena, block: Block) {
    let prev = arena.prev(block);
    let next = arena.next(block);
    match prev {
      Some(prev) => arena.set_next(prev, next),
      None => self.head = next,
    }
    if let Some(next) = next {
      arena.set_prev(next, prev);
    }
  }

  /// Points the neighbors recorded in `block`'s links back at it.
  fn relink(&mut self, arena: &Arena, block: Block) {
    match arena.prev(block) {
      Some(prev) => arena.set_next(prev, Some(block)),
      None => self.head = Some(block),
    }
    if let Some(next) = arena.next(block) {
      arena.set_prev(next, Some(block));
    }
  }
}

#[cfg(test)]
mod tests {
  use core::ptr::NonNull;

  use rstest::rstest;

  use super::*;

  const LEN: usize = 4096;

  struct Fixture {
    _backing: Vec<u64>,
    arena: Arena,
    list: FreeList,
  }

  impl Fixture {
    fn new() -> Self {
      let mut backing = vec![0u64; LEN / 8];
      let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
      let arena = unsafe { Arena::format(base, LEN) };
      Self {
        _backing: backing,
        arena,
        list: FreeList::new(),
      }
    }

    fn take(&mut self, payload: usize) -> Block {
      self.list.take(&self.arena, payload).expect("fixture arena has room")
    }

    fn free_offsets(&self) -> Vec<usize> {
      self.list.iter(&self.arena).map(Block::offset).collect()
    }
  }

  #[test]
  fn take_splits_front_of_first_fit() {
    let mut fx = Fixture::new();
    let block = fx.take(64);

    assert_eq!(block, Block::ORIGIN);
    assert_eq!(fx.arena.size(block), 64 + HEADER_SIZE);
    assert_eq!(fx.free_offsets(), [64 + HEADER_SIZE]);
    assert_eq!(fx.arena.size(Block::at(64 + HEADER_SIZE)), LEN - 64 - HEADER_SIZE);
  }

  #[rstest]
  #[case::exact(LEN - HEADER_SIZE)]
  #[case::remainder_below_two_headers(LEN - 2 * HEADER_SIZE)]
  fn take_hands_over_whole_block_without_useful_remainder(#[case] payload: usize) {
    let mut fx = Fixture::new();
    let block = fx.take(payload);

    assert_eq!(fx.arena.size(block), LEN);
    assert!(fx.free_offsets().is_empty());
  }

  #[test]
  fn take_fails_when_nothing_fits() {
    let mut fx = Fixture::new();
    assert!(fx.list.take(&fx.arena, LEN).is_none());
    let _ = fx.take(LEN - HEADER_SIZE);
    assert!(fx.list.take(&fx.arena, 8).is_none());
  }

  #[test]
  fn release_into_empty_list_becomes_head() {
    let mut fx = Fixture::new();
    let block = fx.take(LEN - HEADER_SIZE);
    assert_eq!(fx.list.release(&fx.arena, block), 0);
    assert_eq!(fx.free_offsets(), [0]);
    assert_eq!(fx.arena.size(Block::ORIGIN), LEN);
  }

  #[test]
  fn release_keeps_address_order_without_merging() {
    let mut fx = Fixture::new();
    let blocks: Vec<_> = (0..5).map(|_| fx.take(32)).collect();

    assert_eq!(fx.list.release(&fx.arena, blocks[3]), 0);
    assert_eq!(fx.list.release(&fx.arena, blocks[1]), 0);
    let offsets = fx.free_offsets();
    assert_eq!(
      offsets,
      [blocks[1].offset(), blocks[3].offset(), fx.arena.end(blocks[4])]
    );
  }

  #[rstest]
  #[case::isolated(&[], 0)]
  #[case::lower_only(&[0], 1)]
  #[case::higher_only(&[2], 1)]
  #[case::both_sides(&[0, 2], 2)]
  fn release_merges_with_adjacent_free_blocks(#[case] freed: &[usize], #[case] merges: usize) {
    let mut fx = Fixture::new();
    let blocks: Vec<_> = (0..4).map(|_| fx.take(40)).collect();

    for &i in freed {
      fx.list.release(&fx.arena, blocks[i]);
    }
    assert_eq!(fx.list.release(&fx.arena, blocks[1]), merges);

    let free = fx.free_offsets();
    assert!(free.windows(2).all(|w| w[0] < w[1]));
    for pair in free.windows(2) {
      assert!(fx.arena.end(Block::at(pair[0])) < pair[1], "adjacent free blocks left unmerged");
    }
  }

  #[test]
  fn three_way_coalesce_restores_single_block() {
    let mut fx = Fixture::new();
    let a = fx.take(100 + 4);
    let b = fx.take(100 + 4);
    let c = fx.take(100 + 4);

    fx.list.release(&fx.arena, b);
    fx.list.release(&fx.arena, a);
    fx.list.release(&fx.arena, c);

    assert_eq!(fx.free_offsets(), [0]);
    assert_eq!(fx.arena.size(Block::ORIGIN), LEN);
  }

  #[test]
  fn contains_tracks_membership() {
    let mut fx = Fixture::new();
    let a = fx.take(16);
    let _b = fx.take(16);
    assert!(!fx.list.contains(&fx.arena, a));
    fx.list.release(&fx.arena, a);
    assert!(fx.list.contains(&fx.arena, a));
  }
}
