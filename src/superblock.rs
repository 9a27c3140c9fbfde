//! Superblocks: one mapped region holding many blocks.
//!
//! The first page holds the [`Superblock`] header; the arena of blocks follows.
//! Free blocks are kept in a bin list: each bin is a doubly linked list of
//! blocks of exactly one size, and the bin heads are themselves doubly linked
//! in ascending size order. All links are quantum offsets from the superblock
//! start, so any process mapping the superblock can walk and mutate the list.
//!
//! ```text
//!  offset 0           data_start                                 data_start + size
//!  ┌──────────────────┬────────┬──────────┬──────────────────────┐
//!  │ Superblock header│ Block  │ Block    │ Block ...            │
//!  │ (one page)       │ used   │ free     │                      │
//!  └──────────────────┴────────┴──────────┴──────────────────────┘
//! ```

use core::{
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::io;

use crate::{
  block::{BLOCK_HEADER_SIZE, Block, FreeBlock, MIN_BLOCK_QUANTA},
  error::{Error, Result},
  lock::ShmMutex,
  offset::{QUANTUM, bytes_to_quanta, offset_of, offset_ptr, quanta_to_bytes},
  policy::ThreadState,
};

/// Magic number to identify valid superblock headers.
const SUPERBLOCK_MAGIC: u64 = 0x5348_4D48_5355_5042; // "SHMHSUPB"

/// Longest heap name a superblock can record.
pub const HEAP_NAME_MAX: usize = 255;

/// Smallest header area the superblock can be laid out in.
pub const SUPERBLOCK_HEADER_SIZE: usize = size_of::<Superblock>();

const _: () = assert!(SUPERBLOCK_HEADER_SIZE <= 4096);

/// Ends of the ascending bin list (quantum offsets, 0 = empty).
#[repr(C)]
struct BinList {
  first: u32,
  last: u32,
}

#[repr(C)]
pub struct Superblock {
  magic: AtomicU64,
  /// Byte offset of this superblock within the heap file.
  offset: usize,
  /// Arena bytes (header page excluded).
  size: usize,
  /// Bytes from the superblock start to the first block.
  data_start: usize,
  /// Bytes held by used blocks, headers included. Written under `bins`.
  used: AtomicUsize,
  bins: ShmMutex<BinList>,
  name_len: usize,
  name: [u8; HEAP_NAME_MAX + 1],
}

/// A free block as seen by diagnostics: byte offset from the superblock start
/// and size in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRange {
  pub offset: usize,
  pub size: usize,
}

/// Quanta needed to serve a `bytes` request: payload plus header, no smaller
/// than a block that can later hold the free links.
pub fn request_quanta(bytes: usize) -> Option<usize> {
  let total = bytes.checked_add(BLOCK_HEADER_SIZE)?;
  let quanta = bytes_to_quanta(total).max(MIN_BLOCK_QUANTA);
  (quanta <= u32::MAX as usize).then_some(quanta)
}

impl Superblock {
  /// Lays out a superblock over `data_start + size` writable bytes at `at`
  /// (one giant free block).
  pub unsafe fn create<'a>(
    at: *mut u8,
    heap: &str,
    offset: usize,
    data_start: usize,
    size: usize,
  ) -> io::Result<&'a Superblock> {
    assert!(data_start >= SUPERBLOCK_HEADER_SIZE && data_start % QUANTUM == 0);
    assert!(size % QUANTUM == 0 && size >= quanta_to_bytes(MIN_BLOCK_QUANTA));
    assert!(bytes_to_quanta(data_start + size) <= u32::MAX as usize);

    let sb = at as *mut Superblock;
    let name = heap.as_bytes();
    let name_len = name.len().min(HEAP_NAME_MAX);

    unsafe {
      ptr::addr_of_mut!((*sb).magic).write(AtomicU64::new(0));
      ptr::addr_of_mut!((*sb).offset).write(offset);
      ptr::addr_of_mut!((*sb).size).write(size);
      ptr::addr_of_mut!((*sb).data_start).write(data_start);
      ptr::addr_of_mut!((*sb).used).write(AtomicUsize::new(0));
      ptr::addr_of_mut!((*sb).name_len).write(name_len);
      let dst = ptr::addr_of_mut!((*sb).name) as *mut u8;
      ptr::copy_nonoverlapping(name.as_ptr(), dst, name_len);
      dst.add(name_len).write(0);
      ShmMutex::init(ptr::addr_of_mut!((*sb).bins), BinList { first: 0, last: 0 })?;

      let sb = &*sb;
      let block = Block::construct(
        offset_ptr(at, data_start),
        bytes_to_quanta(data_start),
        bytes_to_quanta(size),
      );
      block.mark_tail();

      let mut bins = sb.bins.lock();
      sb.queue_free(&mut bins, block as *const Block as *mut FreeBlock);
      drop(bins);

      // Published last: a header only validates once fully built.
      sb.magic.store(SUPERBLOCK_MAGIC, Ordering::Release);
      Ok(sb)
    }
  }

  #[inline]
  pub fn valid(&self) -> bool {
    self.magic.load(Ordering::Acquire) == SUPERBLOCK_MAGIC
  }

  #[inline]
  pub fn offset(&self) -> usize {
    self.offset
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn used(&self) -> usize {
    self.used.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn data_start(&self) -> usize {
    self.data_start
  }

  /// Total mapped extent: header page plus arena.
  #[inline]
  pub fn extent(&self) -> usize {
    self.data_start + self.size
  }

  pub fn heap_name(&self) -> &str {
    core::str::from_utf8(&self.name[..self.name_len.min(HEAP_NAME_MAX)]).unwrap_or("")
  }

  #[inline]
  fn base(&self) -> *mut u8 {
    self as *const Superblock as *mut u8
  }

  #[inline]
  fn begin(&self) -> *mut Block {
    unsafe { offset_ptr(self.base(), self.data_start) }
  }

  #[inline]
  fn end(&self) -> *mut Block {
    unsafe { offset_ptr(self.base(), self.data_start + self.size) }
  }

  #[inline]
  fn free_block(&self, offset: u32) -> *mut FreeBlock {
    if offset == 0 {
      null_mut()
    } else {
      unsafe { offset_ptr(self.base(), quanta_to_bytes(offset as usize)) }
    }
  }

  /// Quantum offset of a block payload within this superblock.
  pub fn block_offset(&self, ptr: *mut u8) -> usize {
    bytes_to_quanta(offset_of(self.base(), ptr) - BLOCK_HEADER_SIZE)
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  pub fn allocate(&self, thread: &ThreadState, bytes: usize) -> Option<NonNull<u8>> {
    let mut bins = match self.bins.try_lock() {
      Some(guard) => {
        thread.uncontended();
        guard
      }
      None => {
        thread.contended();
        self.bins.lock()
      }
    };

    let quanta = request_quanta(bytes)?;
    let found = unsafe { self.find_available(&bins, quanta) };
    if found.is_null() {
      return None;
    }

    unsafe {
      let block = &(*found).block;
      debug_assert!(block.valid() && block.is_free() && block.size() >= quanta);

      // The remainder, if any, has a different size, so it is re-queued below.
      self.remove_free(&mut bins, found);

      // Remainders too small for the free links stay attached to the block.
      if block.size() - quanta >= MIN_BLOCK_QUANTA {
        let rest = block.split(quanta);
        self.queue_free(&mut bins, rest as *const Block as *mut FreeBlock);
      }

      block.mark_used();
      let next = block.next();
      if next != self.end() {
        debug_assert!((*next).valid());
        (*next).set_previous_used();
      }
      self.used.fetch_add(block.byte_size(), Ordering::Relaxed);

      #[cfg(feature = "validate")]
      if let Err(err) = self.check(&bins) {
        panic!("{err}");
      }

      NonNull::new(block.data())
    }
  }

  /// Drops one reference to the block at `ptr`, returning it to its
  /// superblock's free list when the count reaches zero. The superblock is
  /// found from the pointer alone, so any process mapping it may call this.
  pub unsafe fn deallocate(ptr: *mut u8) {
    // Accept null for parity with free().
    if ptr.is_null() {
      return;
    }

    let block = unsafe { Block::from_payload(ptr) };
    assert!(block.valid(), "deallocate: corrupt block header at {ptr:p}");
    let remaining = block.decref();
    debug_assert!(remaining >= 0, "deallocate: block at {ptr:p} released twice");
    if remaining == 0 {
      let superblock = unsafe { &*block.superblock() };
      debug_assert!(superblock.valid());
      unsafe { superblock.release(block as *const Block as *mut Block) };
    }
  }

  unsafe fn release(&self, block: *mut Block) {
    let mut bins = self.bins.lock();
    let mut block = block;

    unsafe {
      debug_assert!((*block).byte_size() >= size_of::<FreeBlock>());
      self.used.fetch_sub((*block).byte_size(), Ordering::Relaxed);

      self.coalesce_next(&mut bins, &*block);
      if (*block).is_previous_free() {
        block = self.coalesce_previous(&mut bins, &*block);
      } else {
        // Mark free so a later release of the previous block can absorb it.
        (*block).mark_free();
      }

      // Written after coalescing so the next block sees the final size.
      (*block).mark_tail();
      self.queue_free(&mut bins, block as *mut FreeBlock);

      #[cfg(feature = "validate")]
      if let Err(err) = self.check(&bins) {
        panic!("{err}");
      }
    }
  }

  /// Takes another reference on the block at quantum offset `block`.
  pub fn attach(&self, block: usize) -> Result<NonNull<u8>> {
    let invalid = || Error::InvalidHandle {
      superblock: self.offset,
      block,
    };

    let first = bytes_to_quanta(self.data_start);
    let last = bytes_to_quanta(self.data_start + self.size) - MIN_BLOCK_QUANTA;
    if block < first || block > last {
      return Err(invalid());
    }

    let header = unsafe { &*offset_ptr::<Block>(self.base(), quanta_to_bytes(block)) };
    if !header.valid() || header.offset() != block || header.is_free() {
      return Err(invalid());
    }
    header.incref();
    NonNull::new(header.data()).ok_or_else(invalid)
  }

  // ===========================================================================
  // Bin list (caller holds the lock)
  // ===========================================================================

  unsafe fn find_available(&self, bins: &BinList, quanta: usize) -> *mut FreeBlock {
    let mut bin = self.free_block(bins.first);
    while !bin.is_null() {
      unsafe {
        debug_assert!((*bin).block.valid() && (*bin).block.is_free());
        if (*bin).block.size() >= quanta {
          // Take the second entry when there is one, so the bin head (and
          // with it the bin list) stays untouched.
          let second = self.free_block((*bin).next_free);
          if !second.is_null() {
            debug_assert!((*second).block.size() == (*bin).block.size());
            return second;
          }
          return bin;
        }
        bin = self.free_block((*bin).next_size);
      }
    }
    null_mut()
  }

  unsafe fn queue_free(&self, bins: &mut BinList, block: *mut FreeBlock) {
    unsafe {
      debug_assert!((*block).block.is_free());
      let offset = (*block).block.offset() as u32;
      let size = (*block).block.size();

      if bins.first == 0 {
        (*block).prev_free = 0;
        (*block).next_free = 0;
        (*block).prev_size = 0;
        (*block).next_size = 0;
        bins.first = offset;
        bins.last = offset;
        return;
      }

      let mut bin = self.free_block(bins.first);
      while !bin.is_null() {
        debug_assert!((*bin).block.valid() && (*bin).block.is_free());
        let bin_size = (*bin).block.size();

        if bin_size == size {
          // Join the existing bin, right behind its head
          (*block).prev_free = (*bin).block.offset() as u32;
          (*block).next_free = (*bin).next_free;
          let next = self.free_block((*block).next_free);
          if !next.is_null() {
            (*next).prev_free = offset;
          }
          (*block).prev_size = 0;
          (*block).next_size = 0;
          (*bin).next_free = offset;
          return;
        }

        if bin_size > size {
          // New bin in front of the first larger one
          (*block).prev_free = 0;
          (*block).next_free = 0;
          (*block).next_size = (*bin).block.offset() as u32;
          (*block).prev_size = (*bin).prev_size;
          let prev = self.free_block((*bin).prev_size);
          if !prev.is_null() {
            (*prev).next_size = offset;
          }
          (*bin).prev_size = offset;
          if (*bin).block.offset() as u32 == bins.first {
            bins.first = offset;
          }
          return;
        }

        bin = self.free_block((*bin).next_size);
      }

      // Larger than every existing bin
      let tail = self.free_block(bins.last);
      (*tail).next_size = offset;
      (*block).prev_free = 0;
      (*block).next_free = 0;
      (*block).prev_size = bins.last;
      (*block).next_size = 0;
      bins.last = offset;
    }
  }

  unsafe fn remove_free(&self, bins: &mut BinList, block: *mut FreeBlock) {
    unsafe {
      let prev = self.free_block((*block).prev_free);
      let next = self.free_block((*block).next_free);

      if !prev.is_null() {
        // Not the bin head: plain unlink
        (*prev).next_free = (*block).next_free;
        if !next.is_null() {
          (*next).prev_free = (*block).prev_free;
        }
        return;
      }

      let prev_size = self.free_block((*block).prev_size);
      let next_size = self.free_block((*block).next_size);
      if !next.is_null() {
        // Promote the next member to bin head
        (*next).prev_free = 0;
        (*next).prev_size = (*block).prev_size;
        (*next).next_size = (*block).next_size;
        if prev_size.is_null() {
          bins.first = (*block).next_free;
        } else {
          (*prev_size).next_size = (*block).next_free;
        }
        if next_size.is_null() {
          bins.last = (*block).next_free;
        } else {
          (*next_size).prev_size = (*block).next_free;
        }
      } else {
        // Last member: the bin disappears
        if prev_size.is_null() {
          bins.first = (*block).next_size;
        } else {
          (*prev_size).next_size = (*block).next_size;
        }
        if next_size.is_null() {
          bins.last = (*block).prev_size;
        } else {
          (*next_size).prev_size = (*block).prev_size;
        }
      }
    }
  }

  unsafe fn coalesce_next(&self, bins: &mut BinList, block: &Block) {
    let next = block.next();
    if next == self.end() {
      return;
    }

    unsafe {
      debug_assert!((*next).valid());
      if (*next).is_free() {
        self.remove_free(bins, next as *mut FreeBlock);
        block.join(&*next);
      } else {
        // Let the neighbour absorb this block when it is released.
        (*next).set_previous_free();
      }
    }
  }

  unsafe fn coalesce_previous(&self, bins: &mut BinList, block: &Block) -> *mut Block {
    unsafe {
      let prev = block.prev();
      debug_assert!((*prev).valid() && (*prev).is_free());

      // Its size changes, so it must move bins.
      self.remove_free(bins, prev as *mut FreeBlock);
      (*prev).join(block);
      prev
    }
  }

  // ===========================================================================
  // Diagnostics
  // ===========================================================================

  /// Free blocks in bin order.
  pub fn free_blocks(&self) -> Vec<FreeRange> {
    let bins = self.bins.lock();
    let mut out = Vec::new();
    let mut bin = self.free_block(bins.first);
    while !bin.is_null() {
      let mut member = bin;
      while !member.is_null() {
        unsafe {
          out.push(FreeRange {
            offset: quanta_to_bytes((*member).block.offset()),
            size: (*member).block.byte_size(),
          });
          member = self.free_block((*member).next_free);
        }
      }
      bin = self.free_block(unsafe { (*bin).next_size });
    }
    out
  }

  /// Walks every block and the whole bin list checking structural invariants.
  /// Best-effort: a debugging aid, not a safety boundary.
  pub fn validate(&self) -> Result<()> {
    let bins = self.bins.lock();
    self.check(&bins)
  }

  fn check(&self, bins: &BinList) -> Result<()> {
    let corrupt = |msg: String| Err(Error::Corrupt(format!("superblock {}: {msg}", self.offset)));

    let end = self.end();
    let mut block = self.begin();
    let mut prev_free = false;
    let mut free_count = 0usize;
    let mut free_bytes = 0usize;
    let mut used_bytes = 0usize;

    while block != end {
      if (block as usize) > (end as usize) {
        return corrupt("block walk overran the arena".into());
      }
      let here = unsafe { &*block };
      let at = bytes_to_quanta(offset_of(self.base(), block));
      if !here.valid() {
        return corrupt(format!("invalid tag at block {at}"));
      }
      if here.offset() != at {
        return corrupt(format!("block {at} records offset {}", here.offset()));
      }
      if here.size() < MIN_BLOCK_QUANTA {
        return corrupt(format!("block {at} is undersized ({} quanta)", here.size()));
      }
      if here.is_previous_free() != prev_free {
        return corrupt(format!("block {at} has a stale previous-free flag"));
      }
      if here.is_free() {
        if prev_free {
          return corrupt(format!("blocks before {at} were not coalesced"));
        }
        let tail = unsafe { (here.next() as *const u8).sub(size_of::<u32>()) as *const u32 };
        if unsafe { tail.read() } as usize != here.size() {
          return corrupt(format!("block {at} has a wrong boundary tag"));
        }
        free_count += 1;
        free_bytes += here.byte_size();
      } else {
        used_bytes += here.byte_size();
      }
      prev_free = here.is_free();
      block = here.next();
    }

    if free_bytes + used_bytes != self.size {
      return corrupt(format!(
        "free {free_bytes} + used {used_bytes} != arena {}",
        self.size
      ));
    }
    if used_bytes != self.used() {
      return corrupt(format!("used counter {} != walked {used_bytes}", self.used()));
    }

    let mut listed = 0usize;
    let mut last_size = 0usize;
    let mut prev_bin = 0u32;
    let mut bin = self.free_block(bins.first);
    while !bin.is_null() {
      let (bin_offset, bin_size) = unsafe { ((*bin).block.offset() as u32, (*bin).block.size()) };
      if bin_size <= last_size {
        return corrupt(format!("bin {bin_offset} is out of order"));
      }
      if unsafe { (*bin).prev_size } != prev_bin {
        return corrupt(format!("bin {bin_offset} has a broken back link"));
      }
      let mut prev_member = 0u32;
      let mut member = bin;
      while !member.is_null() {
        let m = unsafe { &*member };
        if !m.block.valid() || !m.block.is_free() || m.block.size() != bin_size {
          return corrupt(format!("bad member {} in bin {bin_offset}", m.block.offset()));
        }
        if m.prev_free != prev_member {
          return corrupt(format!("member {} has a broken back link", m.block.offset()));
        }
        listed += 1;
        if listed > free_count {
          return corrupt("bin list holds more blocks than the arena".into());
        }
        prev_member = m.block.offset() as u32;
        member = self.free_block(m.next_free);
      }
      last_size = bin_size;
      prev_bin = bin_offset;
      bin = self.free_block(unsafe { (*bin).next_size });
    }
    if prev_bin != bins.last {
      return corrupt("bin list tail mismatch".into());
    }
    if listed != free_count {
      return corrupt(format!("{free_count} free blocks but {listed} listed"));
    }
    Ok(())
  }
}
