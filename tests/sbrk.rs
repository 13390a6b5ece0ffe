use tagmalloc::{Allocator, Config, SbrkSource};

#[test]
fn sbrk_backed_heap_allocates_and_coalesces() {
  let allocator = Allocator::new(
    SbrkSource,
    Config::new().with_extent_size(64 * 1024).unwrap(),
  );

  let blocks: Vec<_> = (1..=50).map(|i| allocator.allocate(i * 100).unwrap()).collect();

  for (i, ptr) in blocks.iter().enumerate() {
    assert_eq!(ptr.as_ptr() as usize % 8, 0);
    unsafe { ptr.as_ptr().write_bytes(i as u8, (i + 1) * 100) };
  }

  for ptr in blocks {
    unsafe { allocator.deallocate(ptr.as_ptr()) };
  }

  allocator.check().unwrap();
  assert_eq!(allocator.free_chunks().len(), allocator.stats().extents);
}
