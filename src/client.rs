//! Consumer side: resolves [`MemoryRef`]s published by other processes' heaps.

use core::ptr::NonNull;
use std::collections::{HashMap, hash_map::Entry};

use parking_lot::Mutex;
use tracing::debug;

use crate::{error::Result, file::SuperblockFile, heap::MemoryRef, superblock::Superblock};

/// Heap files opened by this process as a consumer, by name. Opening never
/// bumps the file refcount: the owner alone decides when a file goes away.
#[derive(Default)]
pub struct HeapClient {
  files: Mutex<HashMap<String, SuperblockFile>>,
}

impl HeapClient {
  pub fn new() -> Self {
    Self::default()
  }

  /// Maps the referenced block and takes a reference on it. The pointer is
  /// valid until deallocated or until [`detach`](Self::detach).
  pub fn fetch(&self, memory_ref: &MemoryRef) -> Result<NonNull<u8>> {
    let mut files = self.files.lock();
    let file = match files.entry(memory_ref.heap.clone()) {
      Entry::Occupied(entry) => entry.into_mut(),
      Entry::Vacant(entry) => {
        let mut file = SuperblockFile::new(memory_ref.heap.clone());
        file.open(false)?;
        entry.insert(file)
      }
    };

    let superblock = file.superblock(memory_ref.superblock)?;
    unsafe { superblock.as_ref() }.attach(memory_ref.block)
  }

  /// Drops one reference, as the owner would. `ptr` must come from
  /// [`fetch`](Self::fetch) or from a heap mapped in this process.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    unsafe { Superblock::deallocate(ptr) };
  }

  pub fn is_mapped(&self, heap: &str) -> bool {
    self.files.lock().contains_key(heap)
  }

  /// Closes every opened file. Outstanding fetched pointers dangle afterwards.
  pub fn detach(&self) {
    let mut files = self.files.lock();
    if !files.is_empty() {
      debug!(files = files.len(), "detaching heap client");
    }
    files.clear();
  }
}

impl Drop for HeapClient {
  fn drop(&mut self) {
    self.detach();
  }
}
