//! In-band chunk headers (boundary tags) and the raw handle used to walk them.
//!
//! Every byte of pointer arithmetic the allocator performs goes through
//! [`Chunk`]. The engines in `heap` and `free_list` only ever call its
//! methods, so the unsafe surface stays in this file.

use std::{mem, ptr::NonNull};

use crate::align::ALIGNMENT;

/// Free-list links. Only a free chunk carries them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Links {
  pub prev: NonNull<Header>,
  pub next: NonNull<Header>,
}

/// Boundary tag placed in front of every chunk, allocated or free.
#[repr(C, align(8))]
pub(crate) struct Header {
  /// Bytes occupied by the chunk, header included. Zero marks a fencepost.
  pub total_size: usize,
  /// `total_size` of the physical left neighbor (zero after a fencepost).
  pub left_size: usize,
  pub allocated: bool,
  pub links: Option<Links>,
}

impl Header {
  pub const fn free(
    total_size: usize,
    left_size: usize,
  ) -> Self {
    Self {
      total_size,
      left_size,
      allocated: false,
      links: None,
    }
  }

  pub const fn fencepost() -> Self {
    Self {
      total_size: 0,
      left_size: 0,
      allocated: true,
      links: None,
    }
  }
}

/// Size of a [`Header`] in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Smallest payload a chunk may carry.
pub const MIN_PAYLOAD: usize = 8;

/// Smallest chunk, header included.
pub const MIN_CHUNK: usize = HEADER_SIZE + MIN_PAYLOAD;

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);

/// Handle to a header living inside an extent.
///
/// Holding a `Chunk` asserts that the header it points at is initialized and
/// that the caller has exclusive access to the heap it belongs to (the heap
/// lock is held, or the heap is owned outright). Both are established by the
/// `unsafe` constructors; every other method relies on them plus the
/// boundary-tag invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Chunk(NonNull<Header>);

impl Chunk {
  /// # Safety
  ///
  /// `header` must point at an initialized header of a heap the caller has
  /// exclusive access to.
  pub unsafe fn from_raw(header: NonNull<Header>) -> Self {
    Self(header)
  }

  /// Recovers the chunk owning a payload pointer.
  ///
  /// # Safety
  ///
  /// `payload` must have been produced by [`Chunk::payload`] on a chunk that
  /// has not been merged away since.
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
  }

  /// Writes `header` at `at` and returns a handle to it.
  ///
  /// # Safety
  ///
  /// `at` must be valid for `HEADER_SIZE` bytes of writes, aligned to
  /// [`ALIGNMENT`], and owned by the caller's heap.
  pub unsafe fn write(
    at: NonNull<u8>,
    header: Header,
  ) -> Self {
    let header_ptr = at.cast::<Header>();
    unsafe { header_ptr.write(header) };
    Self(header_ptr)
  }

  pub fn as_ptr(self) -> NonNull<Header> {
    self.0
  }

  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  pub fn total_size(self) -> usize {
    unsafe { (*self.0.as_ptr()).total_size }
  }

  pub fn set_total_size(
    self,
    total_size: usize,
  ) {
    unsafe { (*self.0.as_ptr()).total_size = total_size }
  }

  pub fn left_size(self) -> usize {
    unsafe { (*self.0.as_ptr()).left_size }
  }

  pub fn set_left_size(
    self,
    left_size: usize,
  ) {
    unsafe { (*self.0.as_ptr()).left_size = left_size }
  }

  pub fn is_allocated(self) -> bool {
    unsafe { (*self.0.as_ptr()).allocated }
  }

  pub fn set_allocated(
    self,
    allocated: bool,
  ) {
    unsafe { (*self.0.as_ptr()).allocated = allocated }
  }

  /// Fenceposts are zero-sized and permanently allocated.
  pub fn is_fencepost(self) -> bool {
    self.total_size() == 0
  }

  pub fn is_free(self) -> bool {
    !self.is_allocated()
  }

  pub fn links(self) -> Option<Links> {
    unsafe { (*self.0.as_ptr()).links }
  }

  pub fn set_links(
    self,
    links: Option<Links>,
  ) {
    unsafe { (*self.0.as_ptr()).links = links }
  }

  pub fn next(self) -> Option<Chunk> {
    self.links().map(|links| Chunk(links.next))
  }

  pub fn prev(self) -> Option<Chunk> {
    self.links().map(|links| Chunk(links.prev))
  }

  pub fn set_next(
    self,
    next: Chunk,
  ) {
    if let Some(links) = unsafe { &mut (*self.0.as_ptr()).links } {
      links.next = next.0;
    }
  }

  pub fn set_prev(
    self,
    prev: Chunk,
  ) {
    if let Some(links) = unsafe { &mut (*self.0.as_ptr()).links } {
      links.prev = prev.0;
    }
  }

  /// Physical right neighbor. Only meaningful for non-fencepost chunks.
  pub fn right(self) -> Chunk {
    debug_assert!(!self.is_fencepost());
    Chunk(unsafe { self.0.byte_add(self.total_size()) })
  }

  /// Physical left neighbor. A zero `left_size` means the left neighbor is
  /// the extent's head fencepost, which sits exactly one header below.
  pub fn left(self) -> Chunk {
    let distance = match self.left_size() {
      0 => HEADER_SIZE,
      size => size,
    };
    Chunk(unsafe { self.0.byte_sub(distance) })
  }

  /// Address `offset` bytes into this chunk, used to place a split-off
  /// header. `offset` must leave room for a header before the chunk ends.
  pub fn at(
    self,
    offset: usize,
  ) -> NonNull<u8> {
    debug_assert!(offset + HEADER_SIZE <= self.total_size());
    unsafe { self.0.cast::<u8>().add(offset) }
  }

  /// First byte after the header.
  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
  }

  /// Usable bytes behind [`Chunk::payload`].
  pub fn payload_size(self) -> usize {
    self.total_size() - HEADER_SIZE
  }
}
