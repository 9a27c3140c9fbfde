//! The named shared-memory file backing one heap.
//!
//! ```text
//!  0            page             page + extent(0)
//!  ┌────────────┬────────────────┬────────────────┬─────
//!  │ Header     │ Superblock 0   │ Superblock 1   │ ...   (append-only)
//!  └────────────┴────────────────┴────────────────┴─────
//! ```
//!
//! Each process maps every superblock it touches separately, at whatever
//! address the kernel picks. Superblocks are discovered lazily: the header page
//! is mapped first to learn the extent, then the whole superblock is mapped.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicI32, Ordering},
};
use std::{collections::BTreeMap, io, os::fd::OwnedFd};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
  error::{Error, Result},
  offset::bytes_to_quanta,
  platform::{
    Mapping, current_pid, file_len, grow, page_size, process_alive, shm_create,
    shm_open_existing, shm_unlink, truncate,
  },
  superblock::{HEAP_NAME_MAX, Superblock},
};

/// Magic number to identify heap files.
const FILE_MAGIC: u32 = 0x5348_4850; // "SHHP"

/// Layout version of the header and superblock structures.
pub const FILE_VERSION: u32 = 1;

#[repr(C)]
struct Header {
  magic: u32,
  version: u32,
  /// Attached processes; the file is unlinked when this reaches zero.
  refcount: AtomicI32,
  creator: libc::pid_t,
}

/// Read-only summary of a heap file, gathered without taking any lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
  /// Arena bytes over all superblocks.
  pub size: usize,
  pub used: usize,
  pub superblocks: usize,
  /// Superblocks with nothing allocated.
  pub unused: usize,
}

pub struct SuperblockFile {
  name: String,
  fd: Option<OwnedFd>,
  header: Option<Mapping>,
  attached: bool,
  max_size: Option<usize>,
  /// Superblocks mapped by this process, by file offset.
  superblocks: Mutex<BTreeMap<usize, Mapping>>,
}

fn growth_error(err: io::Error) -> Error {
  match err.raw_os_error() {
    Some(libc::ENOSPC) | Some(libc::EFBIG) => Error::OutOfSpace(err.to_string()),
    _ => Error::Io(err),
  }
}

impl SuperblockFile {
  /// A handle on the file called `name`; nothing is opened until
  /// [`create`](Self::create) or [`open`](Self::open).
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      fd: None,
      header: None,
      attached: false,
      max_size: None,
      superblocks: Mutex::new(BTreeMap::new()),
    }
  }

  /// Caps the file length; superblock creation past it fails with `OutOfSpace`.
  pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
    self.max_size = max_size;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_open(&self) -> bool {
    self.header.is_some()
  }

  pub fn is_attached(&self) -> bool {
    self.attached
  }

  fn check_name(&self) -> Result<()> {
    if self.name.is_empty() || self.name.len() > HEAP_NAME_MAX || self.name.contains('/') {
      return Err(Error::Config(format!("invalid heap name {:?}", self.name)));
    }
    Ok(())
  }

  fn fd(&self) -> Result<&OwnedFd> {
    self.fd.as_ref().ok_or_else(|| Error::NotOpen(self.name.clone()))
  }

  fn header(&self) -> Result<&Header> {
    self
      .header
      .as_ref()
      .map(|m| unsafe { &*(m.as_ptr() as *const Header) })
      .ok_or_else(|| Error::NotOpen(self.name.clone()))
  }

  // ===========================================================================
  // Lifecycle
  // ===========================================================================

  /// Creates the file, becoming its owner with a refcount of 1.
  pub fn create(&mut self) -> Result<()> {
    if self.is_open() {
      return Err(Error::AlreadyOpen(self.name.clone()));
    }
    self.check_name()?;

    let fd = shm_create(&self.name)?;
    let page = page_size();
    let header = grow(&fd, 0, page)
      .map_err(growth_error)
      .and_then(|()| Mapping::new(&fd, page, 0).map_err(Error::from));
    let header = match header {
      Ok(header) => header,
      Err(err) => {
        let _ = shm_unlink(&self.name);
        return Err(err);
      }
    };

    unsafe {
      (header.as_ptr() as *mut Header).write(Header {
        magic: FILE_MAGIC,
        version: FILE_VERSION,
        refcount: AtomicI32::new(1),
        creator: current_pid(),
      });
    }

    self.fd = Some(fd);
    self.header = Some(header);
    self.attached = true;
    debug!(heap = %self.name, "created heap file");
    Ok(())
  }

  /// Opens an existing file. With `attach`, the file stays alive until this
  /// handle closes; without it, this process is a pure consumer.
  pub fn open(&mut self, attach: bool) -> Result<()> {
    if self.is_open() {
      return Err(Error::AlreadyOpen(self.name.clone()));
    }
    self.check_name()?;

    let fd = shm_open_existing(&self.name)?;
    let page = page_size();
    let incompatible = |reason: String| Error::Incompatible {
      name: self.name.clone(),
      reason,
    };

    if file_len(&fd)? < page {
      return Err(incompatible("file shorter than its header".into()));
    }
    let header = Mapping::new(&fd, page, 0)?;
    let h = unsafe { &*(header.as_ptr() as *const Header) };
    if h.magic != FILE_MAGIC {
      return Err(incompatible(format!("bad magic {:#010x}", h.magic)));
    }
    if h.version != FILE_VERSION {
      return Err(incompatible(format!(
        "version {} (expected {FILE_VERSION})",
        h.version
      )));
    }
    if attach {
      h.refcount.fetch_add(1, Ordering::AcqRel);
    }

    self.fd = Some(fd);
    self.header = Some(header);
    self.attached = attach;
    debug!(heap = %self.name, attach, "opened heap file");
    Ok(())
  }

  /// Unmaps everything and, if attached, drops this process's reference,
  /// unlinking the file on the last one. Idempotent.
  pub fn close(&mut self) {
    let Some(header) = self.header.take() else {
      return;
    };
    self.superblocks.get_mut().clear();

    if self.attached {
      self.attached = false;
      let h = unsafe { &*(header.as_ptr() as *const Header) };
      if h.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        match shm_unlink(&self.name) {
          Ok(()) => debug!(heap = %self.name, "unlinked heap file"),
          // Someone else already cleaned up.
          Err(err) if err.kind() == io::ErrorKind::NotFound => {}
          Err(err) => warn!(heap = %self.name, %err, "failed to unlink heap file"),
        }
      }
    }

    drop(header);
    self.fd = None;
  }

  pub fn refcount(&self) -> Result<i32> {
    Ok(self.header()?.refcount.load(Ordering::Acquire))
  }

  pub fn creator(&self) -> Result<libc::pid_t> {
    Ok(self.header()?.creator)
  }

  /// True if the creating process no longer exists. Detection only; reclaiming
  /// the file is left to whoever asks.
  pub fn is_orphaned(&self) -> Result<bool> {
    Ok(!process_alive(self.creator()?))
  }

  // ===========================================================================
  // Superblocks
  // ===========================================================================

  /// The superblock at file offset `offset`, mapping it on first use.
  pub fn superblock(&self, offset: usize) -> Result<NonNull<Superblock>> {
    let fd = self.fd()?;
    let mut mapped = self.superblocks.lock();
    if let Some(mapping) = mapped.get(&offset) {
      return Ok(unsafe { NonNull::new_unchecked(mapping.as_ptr() as *mut Superblock) });
    }

    let page = page_size();
    let len = file_len(fd)?;
    if offset < page || offset % page != 0 || offset.saturating_add(page) > len {
      return Err(Error::InvalidHandle {
        superblock: offset,
        block: 0,
      });
    }

    // The extent is only known once the header page is readable.
    let probe = Mapping::new(fd, page, offset)?;
    let extent = {
      let sb = unsafe { &*(probe.as_ptr() as *const Superblock) };
      if !sb.valid() || sb.offset() != offset {
        return Err(Error::Incompatible {
          name: self.name.clone(),
          reason: format!("no superblock at offset {offset}"),
        });
      }
      sb.extent()
    };
    drop(probe);

    if offset + extent > len {
      return Err(Error::Incompatible {
        name: self.name.clone(),
        reason: format!("superblock at offset {offset} runs past the end of the file"),
      });
    }

    let mapping = Mapping::new(fd, extent, offset)?;
    let sb = unsafe { NonNull::new_unchecked(mapping.as_ptr() as *mut Superblock) };
    mapped.insert(offset, mapping);
    debug!(heap = %self.name, offset, extent, "mapped superblock");
    Ok(sb)
  }

  /// Appends a superblock with an arena of at least `bytes`.
  pub fn create_superblock(&self, bytes: usize) -> Result<NonNull<Superblock>> {
    let fd = self.fd()?;
    let page = page_size();
    let too_large = || Error::OutOfSpace(format!("superblock of {bytes} bytes"));
    let size = bytes.max(1).checked_next_multiple_of(page).ok_or_else(too_large)?;
    let extent = size.checked_add(page).ok_or_else(too_large)?;

    let mut mapped = self.superblocks.lock();
    let offset = file_len(fd)?;
    let end = offset
      .checked_add(extent)
      .ok_or_else(|| Error::OutOfSpace(format!("superblock of {size} bytes")))?;
    if let Some(max) = self.max_size {
      if end > max {
        return Err(Error::OutOfSpace(format!(
          "heap file {} would grow to {end} bytes (limit {max})",
          self.name
        )));
      }
    }
    if bytes_to_quanta(extent) > u32::MAX as usize {
      return Err(Error::OutOfSpace(format!("superblock of {size} bytes")));
    }

    let name = &self.name;
    let sb = self.append(&mut mapped, offset, extent, |at| unsafe {
      Superblock::create(at, name, offset, page, size).map(NonNull::from)
    })?;
    debug!(heap = %self.name, offset, size, "created superblock");
    Ok(sb)
  }

  /// Grows the file by `extent` bytes at `offset` and lets `build` lay out a
  /// superblock there. Any failure truncates the file back to `offset`, so
  /// the chain never ends in a tail without a valid header.
  fn append<F>(
    &self,
    mapped: &mut BTreeMap<usize, Mapping>,
    offset: usize,
    extent: usize,
    build: F,
  ) -> Result<NonNull<Superblock>>
  where
    F: FnOnce(*mut u8) -> io::Result<NonNull<Superblock>>,
  {
    let fd = self.fd()?;
    grow(fd, offset, extent).map_err(growth_error)?;

    let built = Mapping::new(fd, extent, offset).and_then(|mapping| {
      let sb = build(mapping.as_ptr())?;
      Ok((mapping, sb))
    });
    match built {
      Ok((mapping, sb)) => {
        mapped.insert(offset, mapping);
        Ok(sb)
      }
      Err(err) => {
        let _ = truncate(fd, offset);
        Err(err.into())
      }
    }
  }

  /// Walks the superblock chain reading only header pages.
  pub fn statistics(&self) -> Result<Statistics> {
    let fd = self.fd()?;
    let page = page_size();
    let len = file_len(fd)?;

    let mut stats = Statistics::default();
    let mut offset = page;
    while offset + page <= len {
      let probe = Mapping::new(fd, page, offset)?;
      let sb = unsafe { &*(probe.as_ptr() as *const Superblock) };
      // A tail still being built by the owner is skipped.
      if !sb.valid() {
        break;
      }
      stats.superblocks += 1;
      stats.size += sb.size();
      stats.used += sb.used();
      if sb.used() == 0 {
        stats.unused += 1;
      }
      offset += sb.extent();
    }
    Ok(stats)
  }
}

impl Drop for SuperblockFile {
  fn drop(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{offset::align_up, policy::ThreadState};
  use core::sync::atomic::AtomicUsize;

  fn unique(tag: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
      "shmheap-file-{tag}-{}-{}",
      current_pid(),
      NEXT.fetch_add(1, Ordering::Relaxed)
    )
  }

  #[test]
  fn last_close_unlinks() {
    let name = unique("refcount");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();
    assert_eq!(owner.refcount().unwrap(), 1);
    assert_eq!(owner.creator().unwrap(), current_pid());

    let mut other = SuperblockFile::new(&name);
    other.open(true).unwrap();
    assert_eq!(owner.refcount().unwrap(), 2);

    owner.close();
    assert_eq!(other.refcount().unwrap(), 1);
    assert!(shm_open_existing(&name).is_ok());

    other.close();
    assert!(shm_open_existing(&name).is_err());
  }

  #[test]
  fn consumer_open_does_not_count() {
    let name = unique("consumer");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();

    let mut consumer = SuperblockFile::new(&name);
    consumer.open(false).unwrap();
    assert!(!consumer.is_attached());
    assert_eq!(owner.refcount().unwrap(), 1);
    drop(consumer);
    assert!(shm_open_existing(&name).is_ok());
  }

  #[test]
  fn create_is_exclusive() {
    let name = unique("exclusive");
    let mut file = SuperblockFile::new(&name);
    file.create().unwrap();
    assert!(matches!(file.create(), Err(Error::AlreadyOpen(_))));
    assert!(matches!(file.open(false), Err(Error::AlreadyOpen(_))));

    let mut again = SuperblockFile::new(&name);
    assert!(matches!(again.create(), Err(Error::Io(_))));
  }

  #[test]
  fn open_rejects_foreign_files() {
    let name = unique("foreign");
    let fd = shm_create(&name).unwrap();
    grow(&fd, 0, page_size()).unwrap();

    let mut file = SuperblockFile::new(&name);
    assert!(matches!(file.open(true), Err(Error::Incompatible { .. })));
    assert!(!file.is_open());

    // Left untouched.
    assert_eq!(file_len(&fd).unwrap(), page_size());
    shm_unlink(&name).unwrap();
  }

  #[test]
  fn open_missing_file_fails() {
    let mut file = SuperblockFile::new(unique("missing"));
    assert!(matches!(file.open(false), Err(Error::Io(_))));
    assert!(matches!(file.statistics(), Err(Error::NotOpen(_))));
  }

  #[test]
  fn rejects_bad_names() {
    assert!(matches!(SuperblockFile::new("a/b").create(), Err(Error::Config(_))));
    assert!(matches!(SuperblockFile::new("").open(false), Err(Error::Config(_))));
  }

  #[test]
  fn superblocks_map_lazily_in_another_view() {
    let name = unique("lazy");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();
    let first = unsafe { owner.create_superblock(8192).unwrap().as_ref() };
    let second = unsafe { owner.create_superblock(100).unwrap().as_ref() };
    assert_eq!(first.offset(), page_size());
    assert_eq!(second.offset(), page_size() + first.extent());
    assert_eq!(second.size(), page_size());

    let ts = ThreadState::new();
    let p = second.allocate(&ts, 40).unwrap();
    let block = second.block_offset(p.as_ptr());

    let mut consumer = SuperblockFile::new(&name);
    consumer.open(false).unwrap();
    let view = unsafe { consumer.superblock(second.offset()).unwrap().as_ref() };
    assert_ne!(view as *const Superblock, second as *const Superblock);
    assert_eq!(view.heap_name(), name);
    assert_eq!(view.used(), second.used());

    // Same block through the other mapping.
    let q = view.attach(block).unwrap();
    unsafe {
      *p.as_ptr() = 7;
      assert_eq!(*q.as_ptr(), 7);
      Superblock::deallocate(q.as_ptr());
      Superblock::deallocate(p.as_ptr());
    }
    assert_eq!(second.used(), 0);

    // Cached after the first lookup.
    let again = consumer.superblock(second.offset()).unwrap();
    assert_eq!(again.as_ptr() as *const Superblock, view as *const Superblock);

    assert!(matches!(
      consumer.superblock(page_size() + 1),
      Err(Error::InvalidHandle { .. })
    ));
    assert!(matches!(
      consumer.superblock(page_size() * 1000),
      Err(Error::InvalidHandle { .. })
    ));
  }

  #[test]
  fn statistics_walk_the_chain() {
    let name = unique("stats");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();
    assert_eq!(owner.statistics().unwrap(), Statistics::default());

    let a = unsafe { owner.create_superblock(4096).unwrap().as_ref() };
    owner.create_superblock(3 * 4096).unwrap();
    let ts = ThreadState::new();
    let p = a.allocate(&ts, 100).unwrap();

    let stats = owner.statistics().unwrap();
    assert_eq!(stats.superblocks, 2);
    assert_eq!(stats.used, a.used());
    assert_eq!(stats.unused, 1);
    assert_eq!(stats.size, align_up(4096, page_size()) + align_up(3 * 4096, page_size()));

    unsafe { Superblock::deallocate(p.as_ptr()) };
    assert_eq!(owner.statistics().unwrap().unused, 2);
  }

  #[test]
  fn size_limit_refuses_growth() {
    let name = unique("limit");
    let page = page_size();
    let mut owner = SuperblockFile::new(&name).with_max_size(Some(3 * page));
    owner.create().unwrap();
    owner.create_superblock(page).unwrap();
    assert!(matches!(owner.create_superblock(page), Err(Error::OutOfSpace(_))));
    assert_eq!(owner.statistics().unwrap().superblocks, 1);
  }

  #[test]
  fn failed_layout_rolls_the_file_back() {
    let name = unique("rollback");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();
    owner.create_superblock(4096).unwrap();
    let end = file_len(owner.fd().unwrap()).unwrap();

    let failed = owner.append(&mut owner.superblocks.lock(), end, 2 * page_size(), |_| {
      Err(io::Error::from_raw_os_error(libc::EAGAIN))
    });
    assert!(matches!(failed, Err(Error::Io(_))));
    assert_eq!(file_len(owner.fd().unwrap()).unwrap(), end);
    assert!(!owner.superblocks.lock().contains_key(&end));

    // The next superblock takes the reclaimed tail and stays visible.
    let next = unsafe { owner.create_superblock(4096).unwrap().as_ref() };
    assert_eq!(next.offset(), end);
    assert_eq!(owner.statistics().unwrap().superblocks, 2);
  }

  #[test]
  fn orphan_probe_follows_creator() {
    let name = unique("orphan");
    let mut owner = SuperblockFile::new(&name);
    owner.create().unwrap();
    assert!(!owner.is_orphaned().unwrap());

    // Pretend the creator was a pid that cannot exist.
    unsafe {
      let header = owner.header.as_ref().unwrap().as_ptr() as *mut Header;
      (*header).creator = libc::pid_t::MAX;
    }
    assert!(owner.is_orphaned().unwrap());
  }
}
