//! # tagmalloc - A Boundary-Tag Free-List Allocator
//!
//! This crate provides a general-purpose memory allocator built on an
//! **explicit free list** with **boundary-tag coalescing**. Memory comes from
//! the operating system in coarse, fixed-size extents (2 MiB by default) and
//! is carved up with nothing but in-band headers: no side tables.
//!
//! ## Overview
//!
//! ```text
//!   Heap made of two extents:
//!
//!   ┌─────┬───┬──────────┬────────┬──────────────┬───┐
//!   │ rec │ F │ free     │ in use │ free         │ F │   extent 1
//!   └─────┴───┴──────────┴────────┴──────────────┴───┘
//!   ┌─────┬───┬─────────────────────────┬────────┬───┐
//!   │ rec │ F │ free                    │ in use │ F │   extent 2
//!   └─────┴───┴─────────────────────────┴────────┴───┘
//!
//!   F = fencepost (zero-size, always allocated)
//!
//!   Free list (newest first):  sentinel ⇄ free(2) ⇄ free(1b) ⇄ free(1a) ⇄ sentinel
//! ```
//!
//! - **Allocation** searches the free list first-fit. A chunk that is larger
//!   than needed is split and the right-hand piece is handed out; when
//!   nothing fits, a new extent is requested and put at the list head.
//! - **Deallocation** merges the chunk with free physical neighbors right
//!   away, so two adjacent free chunks never exist. Fenceposts stop merging
//!   at extent edges.
//! - **Concurrency**: one lock serializes every operation.
//!
//! ## Crate Structure
//!
//! ```text
//!   tagmalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── header     - Chunk header / boundary tags (internal)
//!   ├── extent     - Extent sources (mmap, sbrk) and extent layout
//!   ├── free_list  - Sentinel-based circular free list (internal)
//!   ├── heap       - Allocation and deallocation engines
//!   ├── allocator  - Locked front end, GlobalAlloc
//!   ├── stats      - Counters and free-list dumps
//!   ├── config     - Extent size and verbosity
//!   ├── error      - Error types
//!   └── global     - Process-wide instance and exit report
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagmalloc::Allocator;
//!
//! let allocator = Allocator::with_defaults();
//!
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(7, 100);
//!     allocator.deallocate(ptr.as_ptr());
//! }
//!
//! assert!(allocator.check().is_ok());
//! println!("{}", allocator.dump_free_list());
//! ```
//!
//! To replace the process allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: tagmalloc::Global = tagmalloc::Global;
//! ```
//!
//! ## Chunk Layout
//!
//! ```text
//!   ┌───────────────────────────┬────────────────────────────┐
//!   │         Header            │         Payload            │
//!   │  total_size   (incl. hdr) │                            │
//!   │  left_size    (neighbor)  │   >= requested bytes,      │
//!   │  allocated                │   8-byte aligned           │
//!   │  links  (free chunks only)│                            │
//!   └───────────────────────────┴────────────────────────────┘
//!                               ▲
//!                               └── Pointer returned to user
//! ```
//!
//! ## Limitations
//!
//! - A single request cannot exceed one extent
//!   ([`Config::max_request`]); larger requests fail with
//!   [`AllocError::UnsupportedSize`].
//! - Memory is never returned to the OS.
//! - Resizing always moves.
//!
//! ## Safety
//!
//! Deallocating or resizing a pointer that did not come from the same
//! allocator, or freeing twice, is undefined behavior.

pub mod align;
mod allocator;
mod config;
mod error;
mod extent;
mod free_list;
mod global;
mod header;
mod heap;
mod stats;

pub use allocator::Allocator;
pub use config::{Config, DEFAULT_EXTENT_SIZE, VERBOSE_ENV};
pub use error::{AllocError, InvariantViolation};
pub use extent::{EXTENT_OVERHEAD, ExtentSource, MmapSource, SbrkSource, chunk_capacity};
pub use global::{Global, RALLOC, install_exit_report};
pub use header::{HEADER_SIZE, MIN_CHUNK, MIN_PAYLOAD};
pub use heap::Heap;
pub use stats::{FreeChunk, Stats, render_free_list};
