//! The per-process heap: one heap file plus a set of pools.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
  block::Block,
  config::Config,
  error::{Error, Result},
  file::{Statistics, SuperblockFile},
  metrics::{Counter, Metrics, MetricsSnapshot},
  offset::{align_up, quanta_to_bytes},
  platform::{current_pid, page_size},
  policy::{HeapPolicy, with_thread_state},
  pool::Pool,
  superblock::{Superblock, request_quanta},
};

/// Cross-process handle on an allocation: which heap file, which superblock
/// (file offset), which block (quantum offset inside the superblock).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRef {
  pub heap: String,
  pub superblock: usize,
  pub block: usize,
}

impl MemoryRef {
  /// Builds the handle for a payload pointer from any heap, owned or fetched.
  pub unsafe fn from_ptr(ptr: *mut u8) -> Result<Self> {
    let invalid = Error::InvalidHandle {
      superblock: 0,
      block: 0,
    };
    if ptr.is_null() {
      return Err(invalid);
    }

    let block = unsafe { Block::from_payload(ptr) };
    if !block.valid() {
      return Err(invalid);
    }
    let superblock = unsafe { &*block.superblock() };
    if !superblock.valid() {
      return Err(invalid);
    }
    Ok(MemoryRef {
      heap: superblock.heap_name().to_owned(),
      superblock: superblock.offset(),
      block: block.offset(),
    })
  }
}

/// Owner of a heap file. Only the owner creates superblocks; anyone mapping
/// the file may release blocks in it.
///
/// Pointers handed out stay valid until deallocated or until the heap is
/// dropped, whichever comes first.
pub struct Heap {
  file: SuperblockFile,
  policy: HeapPolicy,
  pools: Vec<Pool>,
  superblock_size: usize,
  /// Serialises superblock creation.
  grow_lock: Mutex<()>,
  /// Cleared after the first failed growth; never set again.
  growable: AtomicBool,
  metrics: Metrics,
}

impl Heap {
  /// File name used for the calling process's heap.
  pub fn default_name() -> String {
    format!("heap-{}", current_pid())
  }

  /// The process heap under the default name, or `None` when the allocator is
  /// disabled and callers should use process-local memory.
  pub fn for_process(config: &Config) -> Result<Option<Heap>> {
    if !config.enabled {
      debug!("shared-memory heap disabled by configuration");
      return Ok(None);
    }
    Heap::with_name(Heap::default_name(), config).map(Some)
  }

  pub fn with_name(name: impl Into<String>, config: &Config) -> Result<Heap> {
    config.validate()?;
    let mut file = SuperblockFile::new(name).with_max_size(config.max_heap_size);
    file.create()?;

    let policy = HeapPolicy::from_config(config);
    let pools = (0..policy.pool_count()).map(Pool::new).collect();
    let metrics = Metrics::new(config.metrics);
    debug!(
      heap = %file.name(),
      ?policy,
      superblock_size = config.superblock_size,
      metrics = metrics.enabled(),
      "created heap"
    );

    Ok(Heap {
      file,
      policy,
      pools,
      superblock_size: align_up(config.superblock_size, page_size()),
      grow_lock: Mutex::new(()),
      growable: AtomicBool::new(true),
      metrics,
    })
  }

  pub fn name(&self) -> &str {
    self.file.name()
  }

  pub fn policy(&self) -> HeapPolicy {
    self.policy
  }

  pub fn file(&self) -> &SuperblockFile {
    &self.file
  }

  /// Pool the calling thread would allocate from right now.
  pub fn pool_id(&self) -> usize {
    with_thread_state(|thread| self.policy.pool_id(thread))
  }

  pub fn is_growable(&self) -> bool {
    self.growable.load(Ordering::Acquire)
  }

  /// `None` when no superblock can serve the request and the heap cannot grow.
  pub fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
    let ptr = with_thread_state(|thread| {
      let pool = &self.pools[self.policy.pool_id(thread)];
      pool.allocate(self, thread, bytes)
    });
    self.metrics.record(match ptr {
      Some(_) => Counter::Allocation,
      None => Counter::FailedAllocation,
    });
    ptr
  }

  /// Releases one reference. `ptr` must come from this allocator (any heap)
  /// and still hold a reference.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    self.metrics.record(Counter::Deallocation);
    unsafe { Superblock::deallocate(ptr) };
  }

  /// Cross-process handle for a live allocation.
  pub unsafe fn get_ref(&self, ptr: *mut u8) -> Result<MemoryRef> {
    unsafe { MemoryRef::from_ptr(ptr) }
  }

  /// Takes another reference on one of this heap's own blocks.
  pub fn attach(&self, memory_ref: &MemoryRef) -> Result<NonNull<u8>> {
    if memory_ref.heap != self.name() {
      return Err(Error::InvalidHandle {
        superblock: memory_ref.superblock,
        block: memory_ref.block,
      });
    }
    let superblock = self.file.superblock(memory_ref.superblock)?;
    unsafe { superblock.as_ref() }.attach(memory_ref.block)
  }

  /// Appends a superblock able to serve `bytes`, unless an earlier growth
  /// already failed.
  pub(crate) fn create_superblock(&self, bytes: usize) -> Option<NonNull<Superblock>> {
    let _guard = self.grow_lock.lock();
    if !self.is_growable() {
      return None;
    }

    let needed = request_quanta(bytes).and_then(|q| quanta_to_bytes(q).checked_mul(2))?;
    let size = align_up(needed.max(self.superblock_size), page_size());

    self.metrics.record(Counter::GrowthAttempt);
    match self.file.create_superblock(size) {
      Ok(superblock) => {
        self.metrics.record(Counter::SuperblockCreated);
        Some(superblock)
      }
      Err(err) => {
        warn!(heap = %self.name(), size, %err, "heap growth failed; heap is no longer growable");
        self.metrics.record(Counter::GrowthFailure);
        self.growable.store(false, Ordering::Release);
        None
      }
    }
  }

  pub fn statistics(&self) -> Result<Statistics> {
    self.file.statistics()
  }

  pub fn superblock_count(&self) -> Result<usize> {
    Ok(self.statistics()?.superblocks)
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  pub(crate) fn metrics_ref(&self) -> &Metrics {
    &self.metrics
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    debug!(heap = %self.name(), "destroying heap");
    self.pools.clear();
    self.file.close();
  }
}
