use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use shmheap::{Config, Heap, PolicyKind, ThreadState};
use std::hint::black_box;

const OPS: u64 = 100_000;

fn heap(tag: &str, policy: PolicyKind) -> Heap {
  let config = Config {
    policy,
    ..Config::default()
  };
  Heap::with_name(format!("shmheap-bench-{tag}-{}", std::process::id()), &config).unwrap()
}

/// Shared heap alloc/free throughput.
fn heap_alloc_free(heap: &Heap, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = heap.allocate(size).unwrap();
      black_box(ptr);
      heap.deallocate(ptr.as_ptr());
    }
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

fn benchmark_heap_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("heap_throughput");
  let thread = heap("thread", PolicyKind::Thread);
  let cpu = heap("cpu", PolicyKind::Cpu);

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("thread_policy", size), &size, |b, &size| {
      b.iter(|| heap_alloc_free(&thread, size))
    });

    group.bench_with_input(BenchmarkId::new("cpu_policy", size), &size, |b, &size| {
      b.iter(|| heap_alloc_free(&cpu, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Live set held across iterations, so frees coalesce with busy neighbours.
fn benchmark_fragmented(c: &mut Criterion) {
  let mut group = c.benchmark_group("heap_fragmented");
  let heap = heap("fragmented", PolicyKind::Thread);

  const LIVE: usize = 1024;
  group.throughput(Throughput::Elements(LIVE as u64));
  group.bench_function("mixed_sizes", |b| {
    b.iter(|| {
      let mut live = Vec::with_capacity(LIVE);
      for i in 0..LIVE {
        live.push(heap.allocate(16 + (i * 97) % 2000).unwrap());
      }
      for ptr in live.iter().step_by(2).chain(live.iter().skip(1).step_by(2)) {
        unsafe { heap.deallocate(ptr.as_ptr()) };
      }
    })
  });
  group.finish();
}

fn benchmark_pool_id(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_id");
  group.throughput(Throughput::Elements(1));
  let state = ThreadState::new();
  let thread = shmheap::HeapPolicy::thread(None);
  let cpu = shmheap::HeapPolicy::cpu(1);
  group.bench_function("thread", |b| b.iter(|| black_box(thread.pool_id(&state))));
  group.bench_function("cpu", |b| b.iter(|| black_box(cpu.pool_id(&state))));
  group.bench_function("sched_getcpu", |b| b.iter(|| black_box(shmheap::cpu_id())));
  group.finish();
}

criterion_group!(benches, benchmark_heap_throughput, benchmark_fragmented, benchmark_pool_id);
criterion_main!(benches);
