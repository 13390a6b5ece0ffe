use std::fmt;

/// Call counters and heap size, as printed by the exit report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  /// Bytes of extents obtained from the OS so far.
  pub heap_size: usize,
  /// Number of extents obtained from the OS so far.
  pub extents: usize,
  pub allocate_calls: usize,
  pub free_calls: usize,
  pub resize_calls: usize,
  pub zero_allocate_calls: usize,
}

impl fmt::Display for Stats {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "\n-------------------")?;
    writeln!(f, "HeapSize:\t{} bytes", self.heap_size)?;
    writeln!(f, "# mallocs:\t{}", self.allocate_calls)?;
    writeln!(f, "# reallocs:\t{}", self.resize_calls)?;
    writeln!(f, "# callocs:\t{}", self.zero_allocate_calls)?;
    writeln!(f, "# frees:\t{}", self.free_calls)?;
    writeln!(f, "\n-------------------")
  }
}

/// One entry of the free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeChunk {
  /// Distance in bytes from the first chunk of the first extent. Negative
  /// when a later extent sits below the first one in the address space.
  pub offset: isize,
  /// `total_size` of the chunk, header included.
  pub size: usize,
}

impl fmt::Display for FreeChunk {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "[offset:{},size:{}]", self.offset, self.size)
  }
}

/// Renders free chunks the way `dump_free_list` reports them.
pub fn render_free_list(chunks: &[FreeChunk]) -> String {
  let entries: Vec<String> = chunks.iter().map(FreeChunk::to_string).collect();
  format!("FreeList: {}", entries.join("->"))
}

/// Fixed-capacity `fmt::Write` sink on the stack. Output past the capacity
/// is dropped.
pub(crate) struct StackWriter<const N: usize> {
  buffer: [u8; N],
  len: usize,
}

impl<const N: usize> StackWriter<N> {
  pub const fn new() -> Self {
    Self {
      buffer: [0; N],
      len: 0,
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.buffer[..self.len]
  }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
  fn write_str(
    &mut self,
    s: &str,
  ) -> fmt::Result {
    let take = s.len().min(N - self.len);
    self.buffer[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
    self.len += take;
    Ok(())
  }
}
