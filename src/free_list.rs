//! Explicit free list: circular, doubly linked, anchored by a sentinel.
//!
//! ```text
//!        ┌──────────────────────────────────────────────────┐
//!        ▼                                                  │
//!   ┌──────────┐   next   ┌─────────┐   next   ┌─────────┐  │
//!   │ sentinel │ ───────► │ chunk A │ ───────► │ chunk B │ ─┘
//!   └──────────┘ ◄─────── └─────────┘ ◄─────── └─────────┘
//!                  prev                  prev
//! ```
//!
//! Order is insertion order, newest at the head. Searching is first fit.

use std::ptr::NonNull;

use crate::header::{Chunk, Header, Links};

pub(crate) struct FreeList {
  sentinel: Chunk,
  len: usize,
}

impl FreeList {
  /// Builds an empty list whose sentinel lives at `slot`.
  ///
  /// # Safety
  ///
  /// `slot` must be valid for `HEADER_SIZE` bytes of writes, aligned, and
  /// must outlive the list.
  pub unsafe fn new(slot: NonNull<u8>) -> Self {
    // The sentinel looks allocated so it can never be mistaken for a chunk.
    let sentinel = unsafe { Chunk::write(slot, Header::fencepost()) };
    sentinel.set_links(Some(Links {
      prev: sentinel.as_ptr(),
      next: sentinel.as_ptr(),
    }));

    Self { sentinel, len: 0 }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  /// First chunk, in list order, with `total_size >= min_size`.
  pub fn search(
    &self,
    min_size: usize,
  ) -> Option<Chunk> {
    self.iter().find(|chunk| chunk.total_size() >= min_size)
  }

  /// Pushes `chunk` at the head of the list.
  pub fn insert(
    &mut self,
    chunk: Chunk,
  ) {
    debug_assert!(chunk.links().is_none());

    let head = self.head();
    chunk.set_links(Some(Links {
      prev: self.sentinel.as_ptr(),
      next: head.as_ptr(),
    }));
    head.set_prev(chunk);
    self.sentinel.set_next(chunk);
    self.len += 1;
  }

  /// Unlinks `chunk`. Does nothing if it is not on the list.
  pub fn remove(
    &mut self,
    chunk: Chunk,
  ) {
    let Some(links) = chunk.links() else {
      return;
    };

    let (prev, next) = unsafe { (Chunk::from_raw(links.prev), Chunk::from_raw(links.next)) };
    prev.set_next(next);
    next.set_prev(prev);
    chunk.set_links(None);
    self.len -= 1;
  }

  pub fn iter(&self) -> Iter {
    Iter {
      sentinel: self.sentinel,
      current: self.head(),
    }
  }

  fn head(&self) -> Chunk {
    // The sentinel always carries links.
    self.sentinel.next().unwrap_or(self.sentinel)
  }
}

pub(crate) struct Iter {
  sentinel: Chunk,
  current: Chunk,
}

impl Iterator for Iter {
  type Item = Chunk;

  fn next(&mut self) -> Option<Chunk> {
    if self.current == self.sentinel {
      return None;
    }

    let chunk = self.current;
    self.current = chunk.next().unwrap_or(self.sentinel);
    Some(chunk)
  }
}
