//! Per-thread state and the sharding policy that maps threads onto pools.

use core::cell::Cell;

use crate::{
  config::{Config, PolicyKind},
  platform::{cpu_count, cpu_id, thread_id_u32},
};

/// Upper bound on the default pool count under the thread policy.
pub const MAX_DEFAULT_POOLS: usize = 8;

/// Per-thread allocation state, created lazily on the thread's first allocation.
pub struct ThreadState {
  /// Stable thread hash; the thread policy derives the pool from it.
  hash: usize,
  /// Lock contention seen by this thread. A tuning signal only.
  contention: Cell<u32>,
}

impl ThreadState {
  pub fn new() -> Self {
    Self {
      hash: thread_id_u32() as usize,
      contention: Cell::new(0),
    }
  }

  #[inline]
  pub fn hash(&self) -> usize {
    self.hash
  }

  #[inline]
  pub fn contention(&self) -> u32 {
    self.contention.get()
  }

  #[inline]
  pub(crate) fn contended(&self) {
    self.contention.set(self.contention.get().saturating_add(1));
  }

  #[inline]
  pub(crate) fn uncontended(&self) {
    self.contention.set(self.contention.get().saturating_sub(1));
  }
}

impl Default for ThreadState {
  fn default() -> Self {
    Self::new()
  }
}

thread_local! {
  static THREAD_STATE: ThreadState = ThreadState::new();
}

/// Runs `f` with the calling thread's state.
pub fn with_thread_state<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
  THREAD_STATE.with(f)
}

/// How allocation traffic is spread across pools. Chosen once per heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapPolicy {
  /// Pool is `thread hash mod pools`, fixed for the thread's lifetime.
  Thread { pools: usize },
  /// Pool is `current cpu / cpus_per_pool`, re-read on every allocation.
  Cpu { cpus_per_pool: usize, pools: usize },
}

impl HeapPolicy {
  pub fn thread(pools: Option<usize>) -> Self {
    let pools = pools.unwrap_or_else(|| cpu_count().min(MAX_DEFAULT_POOLS));
    HeapPolicy::Thread { pools: pools.max(1) }
  }

  pub fn cpu(cpus_per_pool: usize) -> Self {
    let cpus_per_pool = cpus_per_pool.max(1);
    HeapPolicy::Cpu {
      cpus_per_pool,
      pools: cpu_count().div_ceil(cpus_per_pool),
    }
  }

  pub fn from_config(config: &Config) -> Self {
    match config.policy {
      PolicyKind::Thread => HeapPolicy::thread(config.pools),
      PolicyKind::Cpu => HeapPolicy::cpu(config.cpus_per_pool),
    }
  }

  pub fn pool_count(&self) -> usize {
    match *self {
      HeapPolicy::Thread { pools } => pools,
      HeapPolicy::Cpu { pools, .. } => pools,
    }
  }

  pub fn pool_id(&self, thread: &ThreadState) -> usize {
    match *self {
      HeapPolicy::Thread { pools } => thread.hash() % pools,
      // CPUs brought online after startup fold into the last pool.
      HeapPolicy::Cpu {
        cpus_per_pool,
        pools,
      } => (cpu_id() / cpus_per_pool).min(pools - 1),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn thread_policy_defaults_to_bounded_cpu_count() {
    let policy = HeapPolicy::thread(None);
    assert_eq!(policy.pool_count(), cpu_count().min(MAX_DEFAULT_POOLS));
    assert_eq!(HeapPolicy::thread(Some(3)).pool_count(), 3);
    assert_eq!(HeapPolicy::thread(Some(0)).pool_count(), 1);
  }

  #[test]
  fn thread_policy_is_stable_per_thread() {
    let policy = HeapPolicy::thread(Some(4));
    let mine = with_thread_state(|ts| policy.pool_id(ts));
    for _ in 0..100 {
      assert_eq!(with_thread_state(|ts| policy.pool_id(ts)), mine);
    }

    let other = thread::spawn(move || with_thread_state(|ts| (ts.hash(), policy.pool_id(ts))))
      .join()
      .unwrap();
    assert_eq!(other.1, other.0 % 4);
  }

  #[test]
  fn cpu_policy_covers_every_cpu() {
    let policy = HeapPolicy::cpu(2);
    assert_eq!(policy.pool_count(), cpu_count().div_ceil(2));
    let ts = ThreadState::new();
    assert!(policy.pool_id(&ts) < policy.pool_count());
  }

  #[test]
  fn contention_counter_saturates_at_zero() {
    let ts = ThreadState::new();
    ts.uncontended();
    assert_eq!(ts.contention(), 0);
    ts.contended();
    ts.contended();
    ts.uncontended();
    assert_eq!(ts.contention(), 1);
  }
}
