// Runs as its own binary: the crate is the process allocator here, and the
// installed logger allocates for every record it handles.

use std::{
  hint::black_box,
  sync::atomic::{AtomicUsize, Ordering},
};

use log::{Level, LevelFilter, Log, Metadata, Record};

#[global_allocator]
static GLOBAL: tagmalloc::Global = tagmalloc::Global;

static RECORDS: AtomicUsize = AtomicUsize::new(0);

struct FormattingLogger;

impl Log for FormattingLogger {
  fn enabled(
    &self,
    metadata: &Metadata,
  ) -> bool {
    metadata.level() <= Level::Trace
  }

  fn log(
    &self,
    record: &Record,
  ) {
    let line = format!("{} {}", record.level(), record.args());
    black_box(line);
    RECORDS.fetch_add(1, Ordering::Relaxed);
  }

  fn flush(&self) {}
}

static LOGGER: FormattingLogger = FormattingLogger;

#[test]
fn allocating_logger_does_not_recurse() {
  log::set_logger(&LOGGER).unwrap();
  log::set_max_level(LevelFilter::Trace);

  let before = RECORDS.load(Ordering::Relaxed);

  let boxed = black_box(Box::new([7u8; 64]));
  let mut grown = black_box(Vec::with_capacity(16));
  grown.extend(boxed.iter().copied());
  grown.extend(boxed.iter().copied());
  assert_eq!(grown.len(), 128);
  drop(grown);
  drop(boxed);

  assert!(RECORDS.load(Ordering::Relaxed) > before);
  tagmalloc::RALLOC.check().unwrap();
}
