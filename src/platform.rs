//! Thin libc wrappers: shared-memory files, mappings, CPU and thread identity.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};
use std::{
  ffi::CString,
  io,
  os::fd::{AsRawFd, FromRawFd, OwnedFd},
  sync::OnceLock,
};

// =============================================================================
// System properties
// =============================================================================

pub fn page_size() -> usize {
  static PAGE: OnceLock<usize> = OnceLock::new();
  *PAGE.get_or_init(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
  })
}

pub fn cpu_count() -> usize {
  let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if count <= 0 { 1 } else { count as usize }
}

pub fn current_pid() -> libc::pid_t {
  unsafe { libc::getpid() }
}

/// Zero-effect liveness probe: signal 0 performs the permission and existence
/// checks without delivering anything.
pub fn process_alive(pid: libc::pid_t) -> bool {
  if pid <= 0 {
    return false;
  }
  if unsafe { libc::kill(pid, 0) } == 0 {
    return true;
  }
  // EPERM: the process exists but belongs to someone else.
  io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// Each thread gets a different ID
pub fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub fn cpu_id() -> usize {
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 { 0 } else { cpu as usize }
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_id() -> usize {
  (thread_id_u32() as usize) % cpu_count()
}

// =============================================================================
// Shared-memory files
// =============================================================================

fn shm_path(name: &str) -> io::Result<CString> {
  CString::new(format!("/{name}"))
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "heap name contains a NUL byte"))
}

fn shm_open(name: &str, flags: libc::c_int) -> io::Result<OwnedFd> {
  let path = shm_path(name)?;
  let fd = unsafe { libc::shm_open(path.as_ptr(), flags, 0o600 as libc::mode_t) };
  if fd < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates a new shared-memory file; fails if the name is taken.
pub fn shm_create(name: &str) -> io::Result<OwnedFd> {
  shm_open(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)
}

pub fn shm_open_existing(name: &str) -> io::Result<OwnedFd> {
  shm_open(name, libc::O_RDWR)
}

pub fn shm_unlink(name: &str) -> io::Result<()> {
  let path = shm_path(name)?;
  if unsafe { libc::shm_unlink(path.as_ptr()) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

pub fn file_len(fd: &OwnedFd) -> io::Result<usize> {
  let mut stat: libc::stat = unsafe { core::mem::zeroed() };
  if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(stat.st_size as usize)
}

pub fn truncate(fd: &OwnedFd, len: usize) -> io::Result<()> {
  if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Extends the file to cover `[offset, offset + len)`, reserving backing pages
/// where the platform allows it, so that exhaustion shows up here and not as
/// a fault on first touch.
#[cfg(target_os = "linux")]
pub fn grow(fd: &OwnedFd, offset: usize, len: usize) -> io::Result<()> {
  let rc = unsafe { libc::posix_fallocate(fd.as_raw_fd(), offset as libc::off_t, len as libc::off_t) };
  if rc != 0 {
    // posix_fallocate reports through its return value, not errno.
    let _ = truncate(fd, offset);
    return Err(io::Error::from_raw_os_error(rc));
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn grow(fd: &OwnedFd, offset: usize, len: usize) -> io::Result<()> {
  truncate(fd, offset + len)
}

// =============================================================================
// Mappings
// =============================================================================

unsafe fn os_mmap_shared(fd: &OwnedFd, len: usize, offset: usize) -> io::Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_SHARED,
      fd.as_raw_fd(),
      offset as libc::off_t,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }
  NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

unsafe fn os_munmap(ptr: *mut u8, len: usize) {
  unsafe { libc::munmap(ptr.cast(), len) };
}

/// A shared, read-write mapping of part of a file. Unmapped on drop.
pub struct Mapping {
  ptr: NonNull<u8>,
  len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
  /// `offset` must be page aligned.
  pub fn new(fd: &OwnedFd, len: usize, offset: usize) -> io::Result<Self> {
    let ptr = unsafe { os_mmap_shared(fd, len, offset)? };
    Ok(Self { ptr, len })
  }

  #[inline]
  pub fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }
}

impl Drop for Mapping {
  fn drop(&mut self) {
    unsafe { os_munmap(self.ptr.as_ptr(), self.len) };
  }
}
