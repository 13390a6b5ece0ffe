//! The process-wide allocator and its exit report.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: tagmalloc::Global = tagmalloc::Global;
//!
//! fn main() {
//!     tagmalloc::install_exit_report();
//!     // ...
//! }
//! ```

use std::{
  alloc::{GlobalAlloc, Layout},
  fmt::Write,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{allocator::Allocator, config::Config, extent::MmapSource, stats::StackWriter};

/// The instance [`Global`] forwards to. Built at compile time; the first
/// extent is only requested on first use.
pub static RALLOC: Allocator<MmapSource> = Allocator::new(MmapSource, Config::DEFAULT);

/// Zero-sized handle to [`RALLOC`] for use with `#[global_allocator]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

unsafe impl GlobalAlloc for Global {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    unsafe { RALLOC.alloc(layout) }
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
  ) {
    unsafe { RALLOC.dealloc(ptr, layout) }
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    unsafe { RALLOC.alloc_zeroed(layout) }
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    unsafe { RALLOC.realloc(ptr, layout, new_size) }
  }
}

static EXIT_REPORT_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Registers an `atexit(3)` hook printing [`RALLOC`]'s stats to stdout,
/// unless `MALLOCVERBOSE=NO` at exit time. Returns `false` if the hook was
/// already installed or could not be registered.
pub fn install_exit_report() -> bool {
  if !claim(&EXIT_REPORT_INSTALLED) {
    return false;
  }

  unsafe { libc::atexit(report_at_exit) == 0 }
}

/// Sets `flag`, returning `true` only for the call that flipped it.
fn claim(flag: &AtomicBool) -> bool {
  !flag.swap(true, Ordering::AcqRel)
}

extern "C" fn report_at_exit() {
  if Config::from_env().verbose() {
    write_report(libc::STDOUT_FILENO);
  }
}

/// Formats the stats on the stack and writes them straight to `fd`, so the
/// report works even while the process is tearing down its own buffers.
fn write_report(fd: libc::c_int) {
  let mut report = StackWriter::<512>::new();
  let _ = write!(report, "{}", RALLOC.stats());

  let bytes = report.as_bytes();
  unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
}
