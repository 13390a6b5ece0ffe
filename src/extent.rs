//! Arena provider and extent layout.
//!
//! ```text
//!   One extent, as handed out by an ExtentSource:
//!
//!   ┌──────────┬───────────┬──────────────────────────────┬───────────┐
//!   │  record  │ fencepost │  chunk(s) ...                │ fencepost │
//!   │ next,size│  size 0   │  total = size - OVERHEAD     │  size 0   │
//!   └──────────┴───────────┴──────────────────────────────┴───────────┘
//!   base                                                   base+size-HEADER
//! ```
//!
//! Records chain every extent (newest first) so diagnostics can walk the
//! whole heap. Fenceposts stop coalescing at the extent edges, which is why
//! two extents are never merged even when the OS hands them out adjacently.

use std::{mem, ptr::NonNull};

use libc::{c_void, intptr_t, sbrk};

use crate::{
  align,
  align::ALIGNMENT,
  align_to,
  error::AllocError,
  header::{Chunk, HEADER_SIZE, Header},
};

/// Somewhere to get raw memory from. Implementations never take memory back.
pub trait ExtentSource {
  /// Returns `size` fresh writable bytes aligned to at least [`ALIGNMENT`].
  ///
  /// Failure is final: the heap reports [`AllocError::OutOfMemory`] to its
  /// caller and does not retry.
  fn acquire(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError>;
}

/// Anonymous private mappings. Plays well with whatever else the process
/// uses for memory, so this is the default source.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapSource;

impl ExtentSource for MmapSource {
  fn acquire(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let address = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      return Err(AllocError::OutOfMemory { requested: size });
    }

    NonNull::new(address as *mut u8).ok_or(AllocError::OutOfMemory { requested: size })
  }
}

/// Grows the data segment with `sbrk(2)`.
///
/// The program break is not guaranteed to be aligned, so each request asks
/// for [`ALIGNMENT`] extra bytes and rounds the base up.
#[derive(Clone, Copy, Debug, Default)]
pub struct SbrkSource;

impl ExtentSource for SbrkSource {
  fn acquire(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let padded = size
      .checked_add(ALIGNMENT)
      .filter(|padded| *padded <= intptr_t::MAX as usize)
      .ok_or(AllocError::OutOfMemory { requested: size })?;

    let address = unsafe { sbrk(padded as intptr_t) };

    if address == usize::MAX as *mut c_void {
      return Err(AllocError::OutOfMemory { requested: size });
    }

    let aligned = align_to!(address as usize, ALIGNMENT);
    NonNull::new(aligned as *mut u8).ok_or(AllocError::OutOfMemory { requested: size })
  }
}

/// Bookkeeping at the very start of every extent.
#[repr(C)]
pub(crate) struct Extent {
  pub next: Option<NonNull<Extent>>,
  pub size: usize,
}

pub(crate) const RECORD_SIZE: usize = align!(mem::size_of::<Extent>());

/// Bytes of an extent not available to chunks: the record and two fenceposts.
pub const EXTENT_OVERHEAD: usize = RECORD_SIZE + 2 * HEADER_SIZE;

/// `total_size` of the single free chunk a fresh extent of `extent_size`
/// bytes starts with.
pub const fn chunk_capacity(extent_size: usize) -> usize {
  extent_size - EXTENT_OVERHEAD
}

/// Lays out a fresh extent: record, head fencepost, one free chunk spanning
/// the rest, tail fencepost. The chunk is not linked into any free list.
///
/// # Safety
///
/// `base` must be valid for `size` bytes of writes, aligned to [`ALIGNMENT`],
/// and `size` must be at least `EXTENT_OVERHEAD + MIN_CHUNK`.
pub(crate) unsafe fn format(
  base: NonNull<u8>,
  size: usize,
  next: Option<NonNull<Extent>>,
) -> (NonNull<Extent>, Chunk) {
  unsafe {
    let record = base.cast::<Extent>();
    record.write(Extent { next, size });

    Chunk::write(base.add(RECORD_SIZE), Header::fencepost());
    let chunk = Chunk::write(
      base.add(RECORD_SIZE + HEADER_SIZE),
      Header::free(chunk_capacity(size), 0),
    );
    Chunk::write(base.add(size - HEADER_SIZE), Header::fencepost());

    (record, chunk)
  }
}

/// Walks the chunks of one extent in address order, fenceposts excluded.
pub(crate) struct Chunks {
  current: Chunk,
}

impl Iterator for Chunks {
  type Item = Chunk;

  fn next(&mut self) -> Option<Chunk> {
    if self.current.is_fencepost() {
      return None;
    }

    let chunk = self.current;
    self.current = chunk.right();
    Some(chunk)
  }
}

/// Read-only view of an extent.
#[derive(Clone, Copy)]
pub(crate) struct ExtentRef(NonNull<Extent>);

impl ExtentRef {
  /// # Safety
  ///
  /// `record` must have been written by [`format`] and the caller must hold
  /// exclusive access to the owning heap.
  pub unsafe fn new(record: NonNull<Extent>) -> Self {
    Self(record)
  }

  pub fn base(self) -> usize {
    self.0.as_ptr() as usize
  }

  pub fn size(self) -> usize {
    unsafe { (*self.0.as_ptr()).size }
  }

  pub fn next(self) -> Option<ExtentRef> {
    unsafe { (*self.0.as_ptr()).next }.map(ExtentRef)
  }

  pub fn first_chunk(self) -> Chunk {
    unsafe { Chunk::from_raw(self.0.cast::<u8>().add(RECORD_SIZE + HEADER_SIZE).cast()) }
  }

  pub fn chunks(self) -> Chunks {
    Chunks {
      current: self.first_chunk(),
    }
  }
}
