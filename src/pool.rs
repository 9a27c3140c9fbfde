//! Pools: shards of a heap's superblocks.

use core::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use crate::{heap::Heap, metrics::Counter, policy::ThreadState, superblock::Superblock};

/// An ordered list of superblocks tried for each allocation. The superblock
/// that last served a request sits at the front.
pub struct Pool {
  id: usize,
  superblocks: Mutex<Vec<NonNull<Superblock>>>,
}

// SAFETY: superblocks are shared structures guarded by their own locks, and
// the mappings they live in outlive every pool of the heap.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
  pub fn new(id: usize) -> Self {
    Self {
      id,
      superblocks: Mutex::new(Vec::new()),
    }
  }

  pub fn allocate(&self, heap: &Heap, thread: &ThreadState, bytes: usize) -> Option<NonNull<u8>> {
    let mut superblocks = match self.superblocks.try_lock() {
      Some(guard) => guard,
      None => {
        thread.contended();
        heap.metrics_ref().record(Counter::Contention);
        self.superblocks.lock()
      }
    };

    for i in 0..superblocks.len() {
      let superblock = unsafe { superblocks[i].as_ref() };
      if let Some(ptr) = superblock.allocate(thread, bytes) {
        if i > 0 {
          let hit = superblocks.remove(i);
          superblocks.insert(0, hit);
        }
        return Some(ptr);
      }
    }

    // Nothing fits: grow. A fresh superblock is sized for the request, so
    // the retry only fails if the request itself is unservable.
    let superblock = heap.create_superblock(bytes)?;
    superblocks.insert(0, superblock);
    debug!(pool = self.id, superblocks = superblocks.len(), "pool grew");
    unsafe { superblock.as_ref() }.allocate(thread, bytes)
  }
}
