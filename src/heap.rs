//! Allocation and deallocation engines.
//!
//! [`Heap`] owns everything: the extent source, the chain of extents, the
//! free list and the counters. It has no locking of its own; `Allocator`
//! wraps it in the one lock that serializes callers.
//!
//! ```text
//!   allocate(n):  rounded = align!(n + HEADER_SIZE)
//!
//!   ┌──────────────── free chunk ────────────────┐
//!   │ hdr │           remainder           │ hdr │ rounded │
//!   └─────┴───────────────────────────────┴─────┴─────────┘
//!     stays on the free list              handed out (right-hand side)
//!
//!   deallocate(p):  merge with a free right neighbor, then let a free left
//!                   neighbor absorb the result. Only a chunk whose left
//!                   neighbor is in use goes back on the list.
//! ```

use std::ptr::{self, NonNull};

use crate::{
  align::{ALIGNMENT, checked_align},
  config::Config,
  error::{AllocError, InvariantViolation},
  extent::{self, Extent, ExtentRef, ExtentSource, chunk_capacity},
  free_list::FreeList,
  header::{Chunk, HEADER_SIZE, Header, MIN_CHUNK},
  stats::{FreeChunk, Stats},
};

/// State that only exists once the first extent has been obtained.
struct Arena {
  free_list: FreeList,
  /// Newest extent; records chain to older ones.
  extents: NonNull<Extent>,
  /// First chunk of the first extent. Diagnostic offsets are relative to it.
  start: usize,
}

impl Arena {
  /// Acquires the first extent and anchors the free list at `slot`.
  fn bootstrap<S: ExtentSource>(
    slot: NonNull<u8>,
    source: &mut S,
    stats: &mut Stats,
    extent_size: usize,
  ) -> Result<Self, AllocError> {
    let (extents, chunk) = obtain_extent(source, stats, extent_size, None)?;
    let free_list = unsafe { FreeList::new(slot) };

    let mut arena = Self {
      free_list,
      extents,
      start: chunk.addr(),
    };
    arena.free_list.insert(chunk);

    Ok(arena)
  }

  /// Fallback when the free list cannot satisfy a request: a whole new
  /// extent goes to the head of the list.
  fn grow_and_insert<S: ExtentSource>(
    &mut self,
    source: &mut S,
    stats: &mut Stats,
    extent_size: usize,
  ) -> Result<Chunk, AllocError> {
    let (extents, chunk) = obtain_extent(source, stats, extent_size, Some(self.extents))?;

    self.extents = extents;
    self.free_list.insert(chunk);

    Ok(chunk)
  }

  fn offset(
    &self,
    chunk: Chunk,
  ) -> isize {
    chunk.addr() as isize - self.start as isize
  }

  fn extents(&self) -> impl Iterator<Item = ExtentRef> {
    let newest = unsafe { ExtentRef::new(self.extents) };
    std::iter::successors(Some(newest), |extent| extent.next())
  }
}

fn obtain_extent<S: ExtentSource>(
  source: &mut S,
  stats: &mut Stats,
  extent_size: usize,
  next: Option<NonNull<Extent>>,
) -> Result<(NonNull<Extent>, Chunk), AllocError> {
  let base = source.acquire(extent_size)?;

  stats.heap_size += extent_size;
  stats.extents += 1;

  Ok(unsafe { extent::format(base, extent_size, next) })
}

/// Carves a `size`-byte chunk off the right end of `chunk`. The remainder
/// keeps its identity and its place on the free list.
fn split(
  chunk: Chunk,
  size: usize,
) -> Chunk {
  let remainder = chunk.total_size() - size;

  let piece = unsafe { Chunk::write(chunk.at(remainder), Header::free(size, remainder)) };
  chunk.set_total_size(remainder);

  let right = piece.right();
  if !right.is_fencepost() {
    right.set_left_size(size);
  }

  piece
}

/// Single-threaded boundary-tag heap.
pub struct Heap<S> {
  source: S,
  config: Config,
  /// Home of the free-list sentinel. Kept across failed bootstraps so a
  /// retry does not ask the source for another one.
  sentinel_slot: Option<NonNull<u8>>,
  arena: Option<Arena>,
  stats: Stats,
}

// The raw pointers inside only ever point into memory this heap owns.
unsafe impl<S: Send> Send for Heap<S> {}

impl<S> Heap<S> {
  /// An empty heap. Nothing is requested from `source` until the first
  /// allocation.
  pub const fn new(
    source: S,
    config: Config,
  ) -> Self {
    Self {
      source,
      config,
      sentinel_slot: None,
      arena: None,
      stats: Stats {
        heap_size: 0,
        extents: 0,
        allocate_calls: 0,
        free_calls: 0,
        resize_calls: 0,
        zero_allocate_calls: 0,
      },
    }
  }

  pub fn config(&self) -> Config {
    self.config
  }

  pub fn stats(&self) -> Stats {
    self.stats
  }

  pub fn free_list_len(&self) -> usize {
    self.arena.as_ref().map_or(0, |arena| arena.free_list.len())
  }

  /// Free chunks in free-list order.
  pub fn free_chunks(&self) -> impl Iterator<Item = FreeChunk> + '_ {
    self.arena.iter().flat_map(|arena| {
      arena.free_list.iter().map(move |chunk| FreeChunk {
        offset: arena.offset(chunk),
        size: chunk.total_size(),
      })
    })
  }

  /// Payload bytes behind a live allocation.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    unsafe { Chunk::from_payload(ptr) }.payload_size()
  }

  /// Walks every extent and the free list, verifying the boundary tags,
  /// chunk sizes, eager coalescing and list membership.
  pub fn check(&self) -> Result<(), InvariantViolation> {
    let Some(arena) = &self.arena else {
      return Ok(());
    };

    let mut found = 0;

    for extent in arena.extents() {
      let expected = chunk_capacity(extent.size());
      let mut spanned = 0;
      let mut left: Option<Chunk> = None;

      for chunk in extent.chunks() {
        let offset = arena.offset(chunk);
        let size = chunk.total_size();

        if size % ALIGNMENT != 0 || size < MIN_CHUNK {
          return Err(InvariantViolation::ChunkSize { offset, size });
        }

        let actual = left.map_or(0, Chunk::total_size);
        if chunk.left_size() != actual {
          return Err(InvariantViolation::BoundaryTag {
            offset,
            recorded: chunk.left_size(),
            actual,
          });
        }

        if chunk.is_free() != chunk.links().is_some() {
          return Err(InvariantViolation::Membership { offset });
        }

        if chunk.is_free() {
          found += 1;

          if let Some(left) = left.filter(|left| left.is_free()) {
            return Err(InvariantViolation::AdjacentFree {
              left: arena.offset(left),
              right: offset,
            });
          }
        }

        spanned += size;
        if spanned > expected {
          break;
        }
        left = Some(chunk);
      }

      if spanned != expected {
        return Err(InvariantViolation::ExtentSpan {
          base: extent.base(),
          spanned,
          expected,
        });
      }
    }

    let mut listed = 0;
    for chunk in arena.free_list.iter() {
      listed += 1;

      let linked = chunk.next().and_then(Chunk::prev) == Some(chunk)
        && chunk.prev().and_then(Chunk::next) == Some(chunk);
      if !chunk.is_free() || !linked {
        return Err(InvariantViolation::BrokenLink {
          offset: arena.offset(chunk),
        });
      }

      if listed > found {
        break;
      }
    }

    if listed != found || arena.free_list.len() != found {
      return Err(InvariantViolation::ListLength {
        listed: arena.free_list.len(),
        found,
      });
    }

    Ok(())
  }
}

impl<S: ExtentSource> Heap<S> {
  /// Returns at least `size` usable bytes, aligned to [`ALIGNMENT`].
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.stats.allocate_calls += 1;
    self.allocate_chunk(size).map(Chunk::payload)
  }

  /// Returns an allocation to the free list. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn deallocate(
    &mut self,
    ptr: *mut u8,
  ) {
    self.stats.free_calls += 1;

    if let Some(ptr) = NonNull::new(ptr) {
      self.release(unsafe { Chunk::from_payload(ptr) });
    }
  }

  /// Moves an allocation into a fresh chunk of `size` bytes. Null behaves
  /// like [`Heap::allocate`]. On failure the old allocation is untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn resize(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.stats.resize_calls += 1;

    let Some(ptr) = NonNull::new(ptr) else {
      return self.allocate_chunk(size).map(Chunk::payload);
    };

    let old = unsafe { Chunk::from_payload(ptr) };
    let new = self.allocate_chunk(size)?;

    unsafe {
      ptr::copy_nonoverlapping(
        old.payload().as_ptr(),
        new.payload().as_ptr(),
        old.payload_size().min(size),
      );
    }
    self.release(old);

    Ok(new.payload())
  }

  /// Allocates `count * elem_size` bytes, all zero.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    elem_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.stats.zero_allocate_calls += 1;

    let size = count
      .checked_mul(elem_size)
      .ok_or(AllocError::Overflow { count, elem_size })?;
    let chunk = self.allocate_chunk(size)?;

    unsafe { chunk.payload().write_bytes(0, chunk.payload_size()) };

    Ok(chunk.payload())
  }

  fn allocate_chunk(
    &mut self,
    size: usize,
  ) -> Result<Chunk, AllocError> {
    let rounded = size
      .checked_add(HEADER_SIZE)
      .and_then(checked_align)
      .filter(|rounded| *rounded <= self.config.chunk_capacity())
      .ok_or(AllocError::UnsupportedSize {
        requested: size,
        capacity: self.config.max_request(),
      })?
      .max(MIN_CHUNK);

    let Self {
      source,
      config,
      sentinel_slot,
      arena,
      stats,
    } = self;

    let arena = match arena {
      Some(arena) => arena,
      None => {
        let slot = match *sentinel_slot {
          Some(slot) => slot,
          None => *sentinel_slot.insert(source.acquire(HEADER_SIZE)?),
        };
        arena.insert(Arena::bootstrap(slot, source, stats, config.extent_size())?)
      }
    };

    let chunk = match arena.free_list.search(rounded) {
      Some(chunk) => chunk,
      None => arena.grow_and_insert(source, stats, config.extent_size())?,
    };

    let chunk = if chunk.total_size() - rounded >= MIN_CHUNK {
      split(chunk, rounded)
    } else {
      arena.free_list.remove(chunk);
      chunk
    };

    chunk.set_allocated(true);
    Ok(chunk)
  }

  fn release(
    &mut self,
    chunk: Chunk,
  ) {
    let Some(arena) = self.arena.as_mut() else {
      panic!("deallocating {:p} on a heap that never allocated", chunk.payload());
    };

    assert!(chunk.is_allocated(), "double free of {:p}", chunk.payload());
    chunk.set_allocated(false);

    let right = chunk.right();
    if right.is_free() {
      arena.free_list.remove(right);
      chunk.set_total_size(chunk.total_size() + right.total_size());

      let beyond = chunk.right();
      if !beyond.is_fencepost() {
        beyond.set_left_size(chunk.total_size());
      }
    }

    let left = chunk.left();
    if left.is_free() {
      left.set_total_size(left.total_size() + chunk.total_size());

      let beyond = left.right();
      if !beyond.is_fencepost() {
        beyond.set_left_size(left.total_size());
      }
    } else {
      arena.free_list.insert(chunk);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extent::{EXTENT_OVERHEAD, testing::LeakedSource};

  const EXTENT: usize = 4096;
  const CAPACITY: usize = EXTENT - EXTENT_OVERHEAD;

  fn heap() -> Heap<LeakedSource> {
    heap_with(LeakedSource::default())
  }

  fn heap_with(source: LeakedSource) -> Heap<LeakedSource> {
    Heap::new(source, Config::new().with_extent_size(EXTENT).unwrap())
  }

  fn chunk_size(size: usize) -> usize {
    crate::align!(size + HEADER_SIZE).max(MIN_CHUNK)
  }

  fn free_list(heap: &Heap<LeakedSource>) -> Vec<FreeChunk> {
    heap.free_chunks().collect()
  }

  #[test]
  fn test_first_allocation_obtains_one_extent() {
    let mut heap = heap();
    assert_eq!(heap.stats().extents, 0);

    heap.allocate(100).unwrap();

    assert_eq!(heap.stats().extents, 1);
    assert_eq!(heap.stats().heap_size, EXTENT);
    assert_eq!(
      free_list(&heap),
      vec![FreeChunk {
        offset: 0,
        size: CAPACITY - chunk_size(100),
      }]
    );
    heap.check().unwrap();
  }

  #[test]
  fn test_split_hands_out_the_right_hand_portion() {
    let mut heap = heap();

    let p = heap.allocate(100).unwrap();
    let chunk = unsafe { Chunk::from_payload(p) };

    assert_eq!(chunk.total_size(), chunk_size(100));
    assert_eq!(chunk.left_size(), CAPACITY - chunk_size(100));
    assert!(chunk.right().is_fencepost());
    assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
  }

  #[test]
  fn test_small_residual_takes_whole_chunk() {
    let mut heap = heap();

    // Leaves fewer than MIN_CHUNK bytes behind, so nothing is split off.
    let size = CAPACITY - HEADER_SIZE - (MIN_CHUNK - ALIGNMENT);
    let p = heap.allocate(size).unwrap();

    assert_eq!(unsafe { heap.usable_size(p) }, CAPACITY - HEADER_SIZE);
    assert_eq!(heap.free_list_len(), 0);
    heap.check().unwrap();
  }

  #[test]
  fn test_allocate_zero_gets_minimal_chunk() {
    let mut heap = heap();

    let p = heap.allocate(0).unwrap();

    assert_eq!(unsafe { heap.usable_size(p) }, MIN_CHUNK - HEADER_SIZE);
    heap.check().unwrap();
  }

  #[test]
  fn test_freed_chunk_is_reused_first() {
    let mut heap = heap();

    let a = heap.allocate(100).unwrap();
    let _b = heap.allocate(200).unwrap();
    unsafe { heap.deallocate(a.as_ptr()) };
    let c = heap.allocate(50).unwrap();

    let a_start = a.as_ptr() as usize - HEADER_SIZE;
    let c_start = c.as_ptr() as usize - HEADER_SIZE;
    assert!(c_start >= a_start && c_start + chunk_size(50) <= a_start + chunk_size(100));
    assert_eq!(heap.stats().extents, 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_three_neighbors_coalesce_into_one() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(128).unwrap();
    let c = heap.allocate(256).unwrap();
    // Keeps the merged chunk from also joining the extent's remainder.
    let _guard = heap.allocate(8).unwrap();

    unsafe {
      heap.deallocate(b.as_ptr());
      heap.check().unwrap();
      heap.deallocate(a.as_ptr());
      heap.check().unwrap();
      heap.deallocate(c.as_ptr());
      heap.check().unwrap();
    }

    let merged = chunk_size(64) + chunk_size(128) + chunk_size(256);
    let sizes: Vec<usize> = heap.free_chunks().map(|chunk| chunk.size).collect();
    assert_eq!(sizes.len(), 2);
    assert!(sizes.contains(&merged));
  }

  #[test]
  fn test_coalescing_is_order_independent() {
    let run = |first_a: bool| {
      let mut heap = heap();
      let a = heap.allocate(300).unwrap();
      let b = heap.allocate(500).unwrap();
      let _guard = heap.allocate(16).unwrap();

      unsafe {
        if first_a {
          heap.deallocate(a.as_ptr());
          heap.deallocate(b.as_ptr());
        } else {
          heap.deallocate(b.as_ptr());
          heap.deallocate(a.as_ptr());
        }
      }

      heap.check().unwrap();
      let mut chunks = free_list(&heap);
      chunks.sort_by_key(|chunk| chunk.offset);
      chunks
    };

    assert_eq!(run(true), run(false));
  }

  #[test]
  fn test_freeing_everything_restores_one_chunk_per_extent() {
    let mut heap = heap();

    let mut pointers: Vec<NonNull<u8>> = (0..40).map(|i| heap.allocate(16 + i * 24).unwrap()).collect();
    assert!(heap.stats().extents > 1);

    // Free in an interleaved order to exercise both merge directions.
    let odd: Vec<_> = pointers.iter().copied().skip(1).step_by(2).collect();
    pointers.retain(|p| !odd.contains(p));
    for p in odd.into_iter().chain(pointers) {
      unsafe { heap.deallocate(p.as_ptr()) };
      heap.check().unwrap();
    }

    let chunks = free_list(&heap);
    assert_eq!(chunks.len(), heap.stats().extents);
    assert!(chunks.iter().all(|chunk| chunk.size == CAPACITY));
  }

  #[test]
  fn test_extents_never_merge() {
    let mut heap = heap();
    let max = heap.config().max_request();

    let a = heap.allocate(max).unwrap();
    let b = heap.allocate(max).unwrap();
    assert_eq!(heap.stats().extents, 2);
    assert_eq!(heap.free_list_len(), 0);

    unsafe {
      heap.deallocate(a.as_ptr());
      heap.deallocate(b.as_ptr());
    }

    assert_eq!(heap.free_list_len(), 2);
    heap.check().unwrap();
  }

  #[test]
  fn test_oversized_request_leaves_heap_untouched() {
    let mut heap = heap();
    let max = heap.config().max_request();

    assert_eq!(
      heap.allocate(max + 1),
      Err(AllocError::UnsupportedSize {
        requested: max + 1,
        capacity: max,
      })
    );
    assert_eq!(heap.stats().heap_size, 0);

    heap.allocate(10).unwrap();
    let before = free_list(&heap);

    assert!(heap.allocate(usize::MAX).is_err());
    assert!(heap.allocate(max + 1).is_err());

    assert_eq!(free_list(&heap), before);
    assert_eq!(heap.stats().extents, 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_out_of_memory_is_reported() {
    // The sentinel slot plus one extent.
    let mut heap = heap_with(LeakedSource::limited(2));
    let max = heap.config().max_request();

    let p = heap.allocate(max).unwrap();
    assert_eq!(
      heap.allocate(1),
      Err(AllocError::OutOfMemory { requested: EXTENT })
    );
    heap.check().unwrap();

    unsafe { heap.deallocate(p.as_ptr()) };
    heap.allocate(1).unwrap();
  }

  #[test]
  fn test_failed_bootstrap_keeps_the_sentinel_slot() {
    // Enough for the sentinel slot only.
    let mut heap = heap_with(LeakedSource::limited(1));

    for _ in 0..3 {
      assert_eq!(
        heap.allocate(8),
        Err(AllocError::OutOfMemory { requested: EXTENT })
      );
    }
    assert_eq!(heap.stats().extents, 0);
    assert_eq!(heap.free_list_len(), 0);

    // One more request is all the retry needs: the slot is reused.
    heap.source.remaining = Some(1);
    heap.allocate(8).unwrap();

    assert_eq!(heap.source.remaining, Some(0));
    assert_eq!(heap.stats().extents, 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_moves_and_copies() {
    let mut heap = heap();

    let p = heap.allocate(16).unwrap();
    unsafe {
      for i in 0..16 {
        p.as_ptr().add(i).write(i as u8);
      }

      let grown = heap.resize(p.as_ptr(), 200).unwrap();
      assert_ne!(grown, p);
      for i in 0..16 {
        assert_eq!(*grown.as_ptr().add(i), i as u8);
      }

      let shrunk = heap.resize(grown.as_ptr(), 4).unwrap();
      for i in 0..4 {
        assert_eq!(*shrunk.as_ptr().add(i), i as u8);
      }
    }

    assert_eq!(heap.stats().resize_calls, 2);
    assert_eq!(heap.stats().allocate_calls, 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_null_allocates_and_failure_keeps_old() {
    let mut heap = heap();

    unsafe {
      let p = heap.resize(ptr::null_mut(), 32).unwrap();
      p.as_ptr().write(0x5A);

      assert!(heap.resize(p.as_ptr(), usize::MAX / 2).is_err());
      assert_eq!(*p.as_ptr(), 0x5A);
      assert!(Chunk::from_payload(p).is_allocated());
    }

    heap.check().unwrap();
  }

  #[test]
  fn test_zero_allocate_clears_recycled_memory() {
    let mut heap = heap();

    let p = heap.allocate(64).unwrap();
    unsafe {
      p.write_bytes(0xFF, 64);
      heap.deallocate(p.as_ptr());
    }

    let z = heap.zero_allocate(8, 8).unwrap();
    let usable = unsafe { heap.usable_size(z) };
    assert!((0..usable).all(|i| unsafe { *z.as_ptr().add(i) } == 0));

    assert_eq!(
      heap.zero_allocate(usize::MAX, 2),
      Err(AllocError::Overflow {
        count: usize::MAX,
        elem_size: 2,
      })
    );
    assert_eq!(heap.stats().zero_allocate_calls, 2);
  }

  #[test]
  fn test_counters() {
    let mut heap = heap();

    let p = heap.allocate(1).unwrap();
    unsafe {
      heap.deallocate(ptr::null_mut());
      heap.deallocate(p.as_ptr());
    }

    let stats = heap.stats();
    assert_eq!(stats.allocate_calls, 1);
    assert_eq!(stats.free_calls, 2);
    assert_eq!(stats.resize_calls, 0);
  }

  #[test]
  fn test_check_reports_broken_boundary_tag() {
    let mut heap = heap();

    let p = heap.allocate(100).unwrap();
    let chunk = unsafe { Chunk::from_payload(p) };
    chunk.set_left_size(chunk.left_size() + ALIGNMENT);

    assert!(matches!(
      heap.check(),
      Err(InvariantViolation::BoundaryTag { .. })
    ));
  }
}
