use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// freeheap alloc/free throughput.
fn freeheap_malloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = freeheap::heap_malloc(size);
    black_box(ptr);
    unsafe { freeheap::heap_free(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Frees every other block of a batch, then refills the holes. Exercises the
/// neighbor scans and coalescing rather than the single-block fast case.
fn freeheap_fragmented(size: usize, batch: usize) {
  let mut ptrs: Vec<*mut u8> = (0..batch).map(|_| freeheap::heap_malloc(size)).collect();
  for ptr in ptrs.iter_mut().step_by(2) {
    unsafe { freeheap::heap_free(*ptr) };
    *ptr = freeheap::heap_malloc(size);
  }
  for ptr in ptrs {
    unsafe { freeheap::heap_free(black_box(ptr)) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("freeheap", size), &size, |b, &size| {
      b.iter(|| freeheap_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_fragmentation(c: &mut Criterion) {
  let mut group = c.benchmark_group("fragmentation");

  for batch in [16, 64, 128] {
    group.throughput(Throughput::Elements(batch as u64));
    group.bench_with_input(BenchmarkId::new("freeheap", batch), &batch, |b, &batch| {
      b.iter(|| freeheap_fragmented(64, batch))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_fragmentation);
criterion_main!(benches);
