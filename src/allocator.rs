//! The thread-safe front end.
//!
//! Every entry point takes the single heap lock through a scoped guard, so
//! it is released on every path out, errors and early returns included.
//! Log records are emitted only after the guard is gone, and never while
//! the same thread is already emitting one: a logger that allocates goes
//! back through the allocator, which stays silent until the outer record is
//! done.

use std::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  mem,
  ptr::{self, NonNull},
};

use log::{debug, trace, warn};
use spin::Mutex;

use crate::{
  align::ALIGNMENT,
  align_to,
  config::Config,
  error::{AllocError, InvariantViolation},
  extent::{ExtentSource, MmapSource},
  heap::Heap,
  stats::{self, FreeChunk, Stats},
};

/// A boundary-tag heap shared between threads.
pub struct Allocator<S = MmapSource> {
  heap: Mutex<Heap<S>>,
}

impl Allocator<MmapSource> {
  /// `mmap`-backed allocator with the default configuration.
  pub const fn with_defaults() -> Self {
    Self::new(MmapSource, Config::DEFAULT)
  }
}

impl Default for Allocator<MmapSource> {
  fn default() -> Self {
    Self::with_defaults()
  }
}

impl<S> Allocator<S> {
  pub const fn new(
    source: S,
    config: Config,
  ) -> Self {
    Self {
      heap: Mutex::new(Heap::new(source, config)),
    }
  }

  pub fn config(&self) -> Config {
    self.heap.lock().config()
  }

  pub fn stats(&self) -> Stats {
    self.heap.lock().stats()
  }

  /// Verifies every heap invariant. Does not allocate.
  pub fn check(&self) -> Result<(), InvariantViolation> {
    self.heap.lock().check()
  }

  /// Snapshot of the free list, in list order.
  pub fn free_chunks(&self) -> Vec<FreeChunk> {
    // The vector is sized outside the lock: growing it inside would call
    // back into this allocator when it is the global one.
    loop {
      let expected = self.heap.lock().free_list_len();
      let mut chunks = Vec::with_capacity(expected + 4);

      let heap = self.heap.lock();
      if heap.free_list_len() <= chunks.capacity() {
        chunks.extend(heap.free_chunks());
        return chunks;
      }
    }
  }

  /// Human-readable free list: `FreeList: [offset:O,size:S]->...`.
  pub fn dump_free_list(&self) -> String {
    stats::render_free_list(&self.free_chunks())
  }

  /// Payload bytes behind a live allocation.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this allocator.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    unsafe { self.heap.lock().usable_size(ptr) }
  }
}

impl<S: ExtentSource> Allocator<S> {
  /// Returns at least `size` usable bytes, aligned to [`ALIGNMENT`].
  pub fn allocate(
    &self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let (result, grown) = self.with_heap(|heap| heap.allocate(size));
    report("allocate", size, &result, grown);
    result
  }

  /// Returns `ptr` to the heap. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this allocator.
  pub unsafe fn deallocate(
    &self,
    ptr: *mut u8,
  ) {
    quietly_nested(|| trace!("deallocate({ptr:p})"));
    unsafe { self.heap.lock().deallocate(ptr) };
  }

  /// Moves an allocation to a fresh chunk of `size` bytes, copying what
  /// fits. Null behaves like [`Allocator::allocate`]. On failure the old
  /// allocation is left as it was.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this allocator.
  pub unsafe fn resize(
    &self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let (result, grown) = self.with_heap(|heap| unsafe { heap.resize(ptr, size) });
    report("resize", size, &result, grown);
    result
  }

  /// Allocates `count * elem_size` zeroed bytes.
  pub fn zero_allocate(
    &self,
    count: usize,
    elem_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let (result, grown) = self.with_heap(|heap| heap.zero_allocate(count, elem_size));
    report("zero_allocate", count.saturating_mul(elem_size), &result, grown);
    result
  }

  /// Runs `operation` under the lock and reports how many extents it added.
  fn with_heap<T>(
    &self,
    operation: impl FnOnce(&mut Heap<S>) -> T,
  ) -> (T, usize) {
    let mut heap = self.heap.lock();
    let before = heap.stats().extents;
    let result = operation(&mut *heap);
    let grown = heap.stats().extents - before;
    (result, grown)
  }
}

thread_local! {
  static LOGGING: Cell<bool> = const { Cell::new(false) };
}

/// Clears the flag when the outermost record is done, panics included.
struct LoggingGuard;

impl Drop for LoggingGuard {
  fn drop(&mut self) {
    let _ = LOGGING.try_with(|logging| logging.set(false));
  }
}

/// Runs `emit` unless this thread is already inside a record, or its
/// thread-locals are gone.
fn quietly_nested(emit: impl FnOnce()) {
  let entered = LOGGING
    .try_with(|logging| !logging.replace(true))
    .unwrap_or(false);

  if entered {
    let _guard = LoggingGuard;
    emit();
  }
}

fn report(
  symbol: &str,
  size: usize,
  result: &Result<NonNull<u8>, AllocError>,
  grown: usize,
) {
  quietly_nested(|| {
    match result {
      Ok(ptr) => trace!("{symbol}({size}) = {ptr:p}"),
      Err(error) => warn!("{symbol}({size}) failed: {error}"),
    }

    if grown > 0 {
      debug!("{symbol}({size}) grew the heap by {grown} extent(s)");
    }
  });
}

// Alignments above ALIGNMENT are served by over-allocating and stashing the
// real payload pointer in the word just below the aligned address.
unsafe fn over_aligned_base(ptr: *mut u8) -> *mut u8 {
  unsafe { ptr.cast::<*mut u8>().sub(1).read() }
}

impl<S: ExtentSource> Allocator<S> {
  fn allocate_over_aligned(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    let Some(padded) = layout.size().checked_add(layout.align()) else {
      return ptr::null_mut();
    };

    let Ok(base) = self.allocate(padded) else {
      return ptr::null_mut();
    };

    let aligned = align_to!(base.as_ptr() as usize + mem::size_of::<usize>(), layout.align());
    let offset = aligned - base.as_ptr() as usize;

    unsafe {
      let aligned = base.as_ptr().add(offset);
      aligned.cast::<*mut u8>().sub(1).write(base.as_ptr());
      aligned
    }
  }
}

unsafe impl<S: ExtentSource + Send> GlobalAlloc for Allocator<S> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return self.allocate_over_aligned(layout);
    }

    self
      .allocate(layout.size())
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    let base = if layout.align() > ALIGNMENT {
      unsafe { over_aligned_base(ptr) }
    } else {
      ptr
    };

    unsafe { self.deallocate(base) }
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      let ptr = self.allocate_over_aligned(layout);
      if !ptr.is_null() {
        unsafe { ptr.write_bytes(0, layout.size()) };
      }
      return ptr;
    }

    self
      .zero_allocate(1, layout.size())
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return unsafe { self.resize(ptr, new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr);
    }

    let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
      return ptr::null_mut();
    };

    unsafe {
      let new = self.alloc(new_layout);
      if !new.is_null() {
        ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
      new
    }
  }
}
