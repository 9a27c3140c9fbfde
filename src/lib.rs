//! A heap that lives in named shared memory. Blocks are addressed by offsets
//! only, so any process mapping a heap file can resolve, reference-count and
//! release them; only the owning process grows the file.
//!
//! ```no_run
//! use shmheap::{Config, Heap, HeapClient};
//!
//! let heap = Heap::with_name("demo", &Config::default())?;
//! let ptr = heap.allocate(64).expect("heap exhausted");
//! let handle = unsafe { heap.get_ref(ptr.as_ptr())? };
//!
//! // Usually in another process, given `handle`.
//! let client = HeapClient::new();
//! let shared = client.fetch(&handle)?;
//! unsafe {
//!   client.deallocate(shared.as_ptr());
//!   heap.deallocate(ptr.as_ptr());
//! }
//! # Ok::<(), shmheap::Error>(())
//! ```

#![allow(clippy::missing_safety_doc)]

mod block;
mod client;
mod config;
mod error;
mod file;
mod heap;
mod lock;
mod metrics;
mod offset;
mod platform;
mod policy;
mod pool;
mod superblock;

pub use client::HeapClient;
pub use config::{
  Config, DEFAULT_CPUS_PER_POOL, DEFAULT_SUPERBLOCK_SIZE, MAX_SUPERBLOCK_SIZE, PolicyKind,
};
pub use error::{Error, Result};
pub use file::{FILE_VERSION, Statistics, SuperblockFile};
pub use heap::{Heap, MemoryRef};
pub use metrics::MetricsSnapshot;
pub use offset::QUANTUM;
pub use platform::{cpu_count, cpu_id, page_size};
pub use policy::{HeapPolicy, ThreadState, with_thread_state};
pub use superblock::{FreeRange, Superblock};
