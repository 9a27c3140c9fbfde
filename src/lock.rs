//! Process-shared mutex living inside mapped memory.

use core::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  ops::{Deref, DerefMut},
  ptr,
};
use std::io;

/// A pthread mutex configured `PTHREAD_PROCESS_SHARED` (and robust on Linux),
/// guarding a `T` stored right next to it. Both must live in memory that every
/// participating process maps, and the mutex is never moved once initialised.
#[repr(C)]
pub struct ShmMutex<T> {
  raw: UnsafeCell<libc::pthread_mutex_t>,
  data: UnsafeCell<T>,
}

// SAFETY: the pthread mutex provides synchronisation for T
unsafe impl<T: Send> Send for ShmMutex<T> {}
unsafe impl<T: Send> Sync for ShmMutex<T> {}

fn check(rc: libc::c_int) -> io::Result<()> {
  if rc == 0 {
    Ok(())
  } else {
    Err(io::Error::from_raw_os_error(rc))
  }
}

impl<T> ShmMutex<T> {
  /// Initialises a mutex and its data in place.
  pub unsafe fn init(at: *mut Self, data: T) -> io::Result<()> {
    unsafe {
      let raw = UnsafeCell::raw_get(ptr::addr_of_mut!((*at).raw));
      let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
      check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

      let result = (|| {
        check(libc::pthread_mutexattr_setpshared(
          attr.as_mut_ptr(),
          libc::PTHREAD_PROCESS_SHARED,
        ))?;
        #[cfg(target_os = "linux")]
        check(libc::pthread_mutexattr_setrobust(
          attr.as_mut_ptr(),
          libc::PTHREAD_MUTEX_ROBUST,
        ))?;
        check(libc::pthread_mutex_init(raw, attr.as_ptr()))
      })();
      libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
      result?;

      UnsafeCell::raw_get(ptr::addr_of_mut!((*at).data)).write(data);
    }
    Ok(())
  }

  pub fn lock(&self) -> ShmMutexGuard<'_, T> {
    let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
    self.acquired(rc)
  }

  pub fn try_lock(&self) -> Option<ShmMutexGuard<'_, T>> {
    let rc = unsafe { libc::pthread_mutex_trylock(self.raw.get()) };
    if rc == libc::EBUSY {
      return None;
    }
    Some(self.acquired(rc))
  }

  fn acquired(&self, rc: libc::c_int) -> ShmMutexGuard<'_, T> {
    #[cfg(target_os = "linux")]
    if rc == libc::EOWNERDEAD {
      // The previous holder died mid-section. The guarded structures are
      // only ever left mid-update by a crash, which validation can detect.
      tracing::warn!("recovering shared mutex abandoned by a dead process");
      unsafe { libc::pthread_mutex_consistent(self.raw.get()) };
      return ShmMutexGuard { lock: self };
    }
    assert!(rc == 0, "shared mutex lock failed: {}", io::Error::from_raw_os_error(rc));
    ShmMutexGuard { lock: self }
  }

  fn unlock(&self) {
    unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
  }
}

/// Guard for a held [`ShmMutex`]; unlocks on every exit path.
pub struct ShmMutexGuard<'a, T> {
  lock: &'a ShmMutex<T>,
}

impl<T> Deref for ShmMutexGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &Self::Target {
    // SAFETY: We hold the lock
    unsafe { &*self.lock.data.get() }
  }
}

impl<T> DerefMut for ShmMutexGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    // SAFETY: We hold the lock
    unsafe { &mut *self.lock.data.get() }
  }
}

impl<T> Drop for ShmMutexGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.unlock();
  }
}
