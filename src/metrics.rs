//! Optional heap counters. All updates are relaxed and skipped when disabled.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
  enabled: bool,
  allocations: AtomicU64,
  failed_allocations: AtomicU64,
  deallocations: AtomicU64,
  superblocks_created: AtomicU64,
  growth_attempts: AtomicU64,
  growth_failures: AtomicU64,
  contention: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
  pub allocations: u64,
  pub failed_allocations: u64,
  pub deallocations: u64,
  pub superblocks_created: u64,
  pub growth_attempts: u64,
  pub growth_failures: u64,
  pub contention: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Counter {
  Allocation,
  FailedAllocation,
  Deallocation,
  SuperblockCreated,
  GrowthAttempt,
  GrowthFailure,
  Contention,
}

impl Metrics {
  pub fn new(enabled: bool) -> Self {
    Self {
      enabled,
      ..Default::default()
    }
  }

  #[inline]
  pub fn enabled(&self) -> bool {
    self.enabled
  }

  #[inline]
  pub(crate) fn record(&self, counter: Counter) {
    if !self.enabled {
      return;
    }
    let slot = match counter {
      Counter::Allocation => &self.allocations,
      Counter::FailedAllocation => &self.failed_allocations,
      Counter::Deallocation => &self.deallocations,
      Counter::SuperblockCreated => &self.superblocks_created,
      Counter::GrowthAttempt => &self.growth_attempts,
      Counter::GrowthFailure => &self.growth_failures,
      Counter::Contention => &self.contention,
    };
    slot.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      allocations: self.allocations.load(Ordering::Relaxed),
      failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
      deallocations: self.deallocations.load(Ordering::Relaxed),
      superblocks_created: self.superblocks_created.load(Ordering::Relaxed),
      growth_attempts: self.growth_attempts.load(Ordering::Relaxed),
      growth_failures: self.growth_failures.load(Ordering::Relaxed),
      contention: self.contention.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disabled_metrics_stay_zero() {
    let metrics = Metrics::new(false);
    metrics.record(Counter::Allocation);
    assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
  }

  #[test]
  fn enabled_metrics_count() {
    let metrics = Metrics::new(true);
    metrics.record(Counter::Allocation);
    metrics.record(Counter::Allocation);
    metrics.record(Counter::GrowthFailure);
    let snap = metrics.snapshot();
    assert_eq!(snap.allocations, 2);
    assert_eq!(snap.growth_failures, 1);
    assert_eq!(snap.deallocations, 0);
  }
}
