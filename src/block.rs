//! Block headers.
//!
//! Every allocation is prefixed by a one-quantum [`Block`] header. While a
//! block is free its payload is reinterpreted as a [`FreeBlock`] carrying the
//! bin-list links, and its last four bytes hold a boundary tag (its size in
//! quanta) so the following block can find its start when coalescing left.

use core::{
  mem::size_of,
  sync::atomic::{AtomicI32, AtomicU32, Ordering},
};

use crate::{
  offset::{QUANTUM, bytes_to_quanta, offset_ptr, quanta_to_bytes},
  superblock::Superblock,
};

/// Magic number to identify valid block headers. Bit 0 is reused as the
/// "previous block is free" flag.
const BLOCK_MAGIC: u32 = 0x5348_4D42; // "SHMB"
const PREV_FREE: u32 = 1;

/// Refcount sentinel for a free block.
const REFCOUNT_FREE: i32 = -1;

pub const BLOCK_HEADER_SIZE: usize = size_of::<Block>();

/// Smallest block that can host the free links plus its boundary tag.
pub const MIN_BLOCK_QUANTA: usize = bytes_to_quanta(size_of::<FreeBlock>() + size_of::<u32>());

const _: () = assert!(BLOCK_MAGIC & PREV_FREE == 0);
const _: () = assert!(BLOCK_HEADER_SIZE == QUANTUM);
const _: () = assert!(quanta_to_bytes(MIN_BLOCK_QUANTA) >= size_of::<FreeBlock>() + size_of::<u32>());

#[repr(C, align(16))]
pub struct Block {
  tag: AtomicU32,
  /// `-1` free, `>= 1` attached that many times.
  refcount: AtomicI32,
  /// Quanta from the start of the owning superblock.
  offset: AtomicU32,
  /// Quanta, header included.
  size: AtomicU32,
}

/// Free-list overlay. Links are quantum offsets within the superblock; 0 is null.
#[repr(C)]
pub struct FreeBlock {
  pub block: Block,
  /// Neighbours inside a bin of equal-size blocks.
  pub prev_free: u32,
  pub next_free: u32,
  /// Neighbouring bins, ascending by size. Only meaningful on a bin head.
  pub prev_size: u32,
  pub next_size: u32,
}

impl Block {
  /// Constructs a free block header in place.
  pub unsafe fn construct<'a>(at: *mut Block, offset: usize, size: usize) -> &'a Block {
    debug_assert!(offset <= u32::MAX as usize && size <= u32::MAX as usize);
    unsafe {
      at.write(Block {
        tag: AtomicU32::new(BLOCK_MAGIC),
        refcount: AtomicI32::new(REFCOUNT_FREE),
        offset: AtomicU32::new(offset as u32),
        size: AtomicU32::new(size as u32),
      });
      &*at
    }
  }

  /// Header of the block whose payload starts at `ptr`.
  #[inline]
  pub unsafe fn from_payload<'a>(ptr: *mut u8) -> &'a Block {
    unsafe { &*(ptr.sub(BLOCK_HEADER_SIZE) as *const Block) }
  }

  #[inline]
  pub fn valid(&self) -> bool {
    self.tag.load(Ordering::Relaxed) & !PREV_FREE == BLOCK_MAGIC
  }

  /// Inverts the tag so stale references to a joined header fail validation.
  #[inline]
  pub fn destroy(&self) {
    self.tag.store(!BLOCK_MAGIC, Ordering::Relaxed);
  }

  #[inline]
  pub fn refcount(&self) -> i32 {
    self.refcount.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_free(&self) -> bool {
    self.refcount() == REFCOUNT_FREE
  }

  #[inline]
  pub fn mark_free(&self) {
    self.refcount.store(REFCOUNT_FREE, Ordering::Release);
  }

  #[inline]
  pub fn mark_used(&self) {
    self.refcount.store(1, Ordering::Release);
  }

  #[inline]
  pub fn incref(&self) -> i32 {
    self.refcount.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Returns the post-decrement count.
  #[inline]
  pub fn decref(&self) -> i32 {
    self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
  }

  #[inline]
  pub fn is_previous_free(&self) -> bool {
    self.tag.load(Ordering::Relaxed) & PREV_FREE != 0
  }

  #[inline]
  pub fn set_previous_free(&self) {
    self.tag.fetch_or(PREV_FREE, Ordering::Relaxed);
  }

  #[inline]
  pub fn set_previous_used(&self) {
    self.tag.fetch_and(!PREV_FREE, Ordering::Relaxed);
  }

  #[inline]
  pub fn offset(&self) -> usize {
    self.offset.load(Ordering::Relaxed) as usize
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.size.load(Ordering::Relaxed) as usize
  }

  #[inline]
  pub fn byte_size(&self) -> usize {
    quanta_to_bytes(self.size())
  }

  #[inline]
  fn addr(&self) -> *mut u8 {
    self as *const Block as *mut u8
  }

  #[inline]
  pub fn data(&self) -> *mut u8 {
    unsafe { self.addr().add(BLOCK_HEADER_SIZE) }
  }

  /// Byte-adjacent following block (may be the arena end).
  #[inline]
  pub fn next(&self) -> *mut Block {
    unsafe { offset_ptr(self.addr(), self.byte_size()) }
  }

  /// Preceding block, located through its boundary tag. Only valid while
  /// [`is_previous_free`](Self::is_previous_free) holds.
  #[inline]
  pub unsafe fn prev(&self) -> *mut Block {
    unsafe {
      let tail = (self.addr().sub(size_of::<u32>()) as *const u32).read();
      self.addr().sub(quanta_to_bytes(tail as usize)) as *mut Block
    }
  }

  /// Writes the boundary tag into the last word of the block.
  #[inline]
  pub unsafe fn mark_tail(&self) {
    unsafe {
      let tail = self.addr().add(self.byte_size() - size_of::<u32>()) as *mut u32;
      tail.write(self.size() as u32);
    }
  }

  /// Truncates this free block to `quanta` and constructs a free block over
  /// the remainder, returning it.
  pub unsafe fn split(&self, quanta: usize) -> &Block {
    let size = self.size();
    debug_assert!(quanta < size);
    debug_assert!(size - quanta >= MIN_BLOCK_QUANTA);

    unsafe {
      let at = offset_ptr::<Block>(self.addr(), quanta_to_bytes(quanta));
      let remainder = Block::construct(at, self.offset() + quanta, size - quanta);
      remainder.mark_tail();
      self.size.store(quanta as u32, Ordering::Relaxed);
      remainder
    }
  }

  /// Absorbs the byte-adjacent `next` block and destroys its header.
  pub fn join(&self, next: &Block) {
    debug_assert!(core::ptr::eq(self.next(), next));
    self
      .size
      .store((self.size() + next.size()) as u32, Ordering::Relaxed);
    next.destroy();
  }

  /// Reverse offset arithmetic to the owning superblock header.
  #[inline]
  pub fn superblock(&self) -> *mut Superblock {
    unsafe { self.addr().sub(quanta_to_bytes(self.offset())) as *mut Superblock }
  }
}
