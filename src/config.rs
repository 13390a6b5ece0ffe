use crate::{
  align::ALIGNMENT,
  error::AllocError,
  extent::{EXTENT_OVERHEAD, chunk_capacity},
  header::{HEADER_SIZE, MIN_CHUNK},
};

/// Size of each extent requested from the OS unless configured otherwise.
pub const DEFAULT_EXTENT_SIZE: usize = 2 * 1024 * 1024;

/// Environment variable controlling the exit report. `NO` silences it.
pub const VERBOSE_ENV: &str = "MALLOCVERBOSE";

/// Allocator tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  extent_size: usize,
  verbose: bool,
}

impl Config {
  pub const DEFAULT: Config = Config {
    extent_size: DEFAULT_EXTENT_SIZE,
    verbose: true,
  };

  /// Smallest accepted extent: room for the record, both fenceposts and one
  /// minimal chunk.
  pub const MIN_EXTENT_SIZE: usize = EXTENT_OVERHEAD + MIN_CHUNK;

  pub const fn new() -> Self {
    Self::DEFAULT
  }

  /// Reads the verbose switch from [`VERBOSE_ENV`].
  ///
  /// Goes through `getenv(3)` directly so it can run inside the allocator
  /// and from an exit hook without allocating.
  pub fn from_env() -> Self {
    let value = unsafe { libc::getenv(c"MALLOCVERBOSE".as_ptr()) };

    let silenced = !value.is_null() && unsafe { std::ffi::CStr::from_ptr(value) }.to_bytes() == b"NO";

    Self::DEFAULT.with_verbose(!silenced)
  }

  pub fn with_extent_size(
    self,
    extent_size: usize,
  ) -> Result<Self, AllocError> {
    if extent_size % ALIGNMENT != 0 || extent_size < Self::MIN_EXTENT_SIZE {
      return Err(AllocError::InvalidExtentSize {
        size: extent_size,
        minimum: Self::MIN_EXTENT_SIZE,
      });
    }

    Ok(Self {
      extent_size,
      ..self
    })
  }

  pub const fn with_verbose(
    self,
    verbose: bool,
  ) -> Self {
    Self { verbose, ..self }
  }

  pub const fn extent_size(&self) -> usize {
    self.extent_size
  }

  pub const fn verbose(&self) -> bool {
    self.verbose
  }

  /// `total_size` of the chunk a fresh extent starts with.
  pub const fn chunk_capacity(&self) -> usize {
    chunk_capacity(self.extent_size)
  }

  /// Largest payload a single request can get.
  pub const fn max_request(&self) -> usize {
    self.chunk_capacity() - HEADER_SIZE
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::DEFAULT
  }
}
