use thiserror::Error;

use crate::align::ALIGNMENT;

/// Why an allocation request could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("out of memory: the OS refused {requested} more bytes")]
  OutOfMemory { requested: usize },

  #[error("unsupported size: {requested} bytes exceeds the {capacity}-byte limit of one extent")]
  UnsupportedSize { requested: usize, capacity: usize },

  #[error("size overflow: {count} * {elem_size} does not fit in usize")]
  Overflow { count: usize, elem_size: usize },

  #[error("invalid extent size {size}: must be a multiple of {align} and at least {minimum} bytes", align = ALIGNMENT)]
  InvalidExtentSize { size: usize, minimum: usize },
}

/// A structural invariant of the heap that does not hold.
///
/// Offsets are relative to the start of the first extent's first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
  #[error("chunk at {offset}: left size {recorded} but left neighbor is {actual} bytes")]
  BoundaryTag {
    offset: isize,
    recorded: usize,
    actual: usize,
  },

  #[error("chunk at {offset}: size {size} is misaligned or below the minimum chunk")]
  ChunkSize { offset: isize, size: usize },

  #[error("chunks at {left} and {right} are adjacent and both free")]
  AdjacentFree { left: isize, right: isize },

  #[error("extent at {base:#x}: chunks span {spanned} bytes, expected {expected}")]
  ExtentSpan {
    base: usize,
    spanned: usize,
    expected: usize,
  },

  #[error("chunk at {offset}: allocated flag disagrees with free-list membership")]
  Membership { offset: isize },

  #[error("free list link broken at {offset}")]
  BrokenLink { offset: isize },

  #[error("free list holds {listed} chunks but the heap has {found} free chunks")]
  ListLength { listed: usize, found: usize },
}
