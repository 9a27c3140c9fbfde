//! Heap configuration, read from `SHMHEAP_*` environment variables.

use crate::error::{Error, Result};

pub const DEFAULT_SUPERBLOCK_SIZE: usize = 2 << 20; // 2MB
pub const DEFAULT_CPUS_PER_POOL: usize = 2;

/// Largest accepted superblock size. Block offsets inside a superblock are
/// `u32` quanta, which caps its extent well above this.
pub const MAX_SUPERBLOCK_SIZE: usize = {
  let max = 1u64 << 35; // 32GB
  if max > usize::MAX as u64 { usize::MAX >> 4 } else { max as usize }
};

const ENV_ENABLE: &str = "SHMHEAP_ENABLE";
const ENV_POLICY: &str = "SHMHEAP_POLICY";
const ENV_POOLS: &str = "SHMHEAP_POOLS";
const ENV_CPUS_PER_POOL: &str = "SHMHEAP_CPUS_PER_POOL";
const ENV_SUPERBLOCK_SIZE: &str = "SHMHEAP_SUPERBLOCK_SIZE";
const ENV_MAX_SIZE: &str = "SHMHEAP_MAX_SIZE";
const ENV_METRICS: &str = "SHMHEAP_METRICS";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
  Thread,
  Cpu,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Master switch. When off, callers use process-local memory instead.
  pub enabled: bool,
  pub policy: PolicyKind,
  /// Pool count override (thread policy).
  pub pools: Option<usize>,
  /// CPUs sharing one pool (cpu policy).
  pub cpus_per_pool: usize,
  /// Arena bytes of a default superblock.
  pub superblock_size: usize,
  /// Cap on the heap file length; growth past it fails.
  pub max_heap_size: Option<usize>,
  pub metrics: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      enabled: true,
      policy: PolicyKind::Thread,
      pools: None,
      cpus_per_pool: DEFAULT_CPUS_PER_POOL,
      superblock_size: DEFAULT_SUPERBLOCK_SIZE,
      max_heap_size: None,
      metrics: false,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Builds a configuration from `lookup`, falling back to defaults for
  /// unset keys.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Config::default();
    let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

    if let Some(v) = get(ENV_ENABLE) {
      config.enabled = parse_bool(ENV_ENABLE, &v)?;
    }
    if let Some(v) = get(ENV_POLICY) {
      config.policy = match v.to_ascii_lowercase().as_str() {
        "thread" => PolicyKind::Thread,
        "cpu" => PolicyKind::Cpu,
        _ => return Err(Error::Config(format!("{ENV_POLICY}: unknown policy {v:?}"))),
      };
    }
    if let Some(v) = get(ENV_POOLS) {
      config.pools = Some(parse_count(ENV_POOLS, &v)?);
    }
    if let Some(v) = get(ENV_CPUS_PER_POOL) {
      config.cpus_per_pool = parse_count(ENV_CPUS_PER_POOL, &v)?;
    }
    if let Some(v) = get(ENV_SUPERBLOCK_SIZE) {
      config.superblock_size = parse_size(ENV_SUPERBLOCK_SIZE, &v)?;
    }
    if let Some(v) = get(ENV_MAX_SIZE) {
      config.max_heap_size = Some(parse_size(ENV_MAX_SIZE, &v)?);
    }
    if let Some(v) = get(ENV_METRICS) {
      config.metrics = parse_bool(ENV_METRICS, &v)?;
    }
    config.validate()?;
    Ok(config)
  }

  /// Rejects values a heap cannot be built from.
  pub fn validate(&self) -> Result<()> {
    if self.superblock_size == 0 || self.superblock_size > MAX_SUPERBLOCK_SIZE {
      return Err(Error::Config(format!(
        "superblock size {} outside 1..={MAX_SUPERBLOCK_SIZE}",
        self.superblock_size
      )));
    }
    Ok(())
  }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
  match value.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(Error::Config(format!("{key}: expected a boolean, got {value:?}"))),
  }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
  match value.parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(Error::Config(format!("{key}: expected a positive integer, got {value:?}"))),
  }
}

/// Byte count with an optional `k`, `m` or `g` suffix (powers of 1024).
fn parse_size(key: &str, value: &str) -> Result<usize> {
  let lower = value.to_ascii_lowercase();
  let (digits, shift) = match lower.strip_suffix(['k', 'm', 'g']) {
    Some(digits) => {
      let shift = match lower.as_bytes()[lower.len() - 1] {
        b'k' => 10,
        b'm' => 20,
        _ => 30,
      };
      (digits, shift)
    }
    None => (lower.as_str(), 0),
  };

  digits
    .trim()
    .parse::<usize>()
    .ok()
    .and_then(|n| n.checked_mul(1usize << shift))
    .filter(|&n| n > 0)
    .ok_or_else(|| Error::Config(format!("{key}: expected a size, got {value:?}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config(vars: &[(&str, &str)]) -> Result<Config> {
    let map: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    Config::from_lookup(|key| map.get(key).cloned())
  }

  #[test]
  fn defaults_when_unset() {
    assert_eq!(config(&[]).unwrap(), Config::default());
  }

  #[test]
  fn reads_every_option() {
    let cfg = config(&[
      ("SHMHEAP_ENABLE", "off"),
      ("SHMHEAP_POLICY", "CPU"),
      ("SHMHEAP_POOLS", "3"),
      ("SHMHEAP_CPUS_PER_POOL", "4"),
      ("SHMHEAP_SUPERBLOCK_SIZE", "64k"),
      ("SHMHEAP_MAX_SIZE", "1G"),
      ("SHMHEAP_METRICS", "yes"),
    ])
    .unwrap();

    assert!(!cfg.enabled);
    assert_eq!(cfg.policy, PolicyKind::Cpu);
    assert_eq!(cfg.pools, Some(3));
    assert_eq!(cfg.cpus_per_pool, 4);
    assert_eq!(cfg.superblock_size, 64 * 1024);
    assert_eq!(cfg.max_heap_size, Some(1 << 30));
    assert!(cfg.metrics);
  }

  #[test]
  fn rejects_bad_values() {
    assert!(matches!(config(&[("SHMHEAP_POLICY", "numa")]), Err(Error::Config(_))));
    assert!(matches!(config(&[("SHMHEAP_POOLS", "0")]), Err(Error::Config(_))));
    assert!(matches!(config(&[("SHMHEAP_ENABLE", "maybe")]), Err(Error::Config(_))));
    assert!(matches!(config(&[("SHMHEAP_SUPERBLOCK_SIZE", "12q")]), Err(Error::Config(_))));
  }

  #[test]
  fn rejects_superblocks_too_large_to_address() {
    let huge = usize::MAX.to_string();
    assert!(matches!(
      config(&[("SHMHEAP_SUPERBLOCK_SIZE", &huge)]),
      Err(Error::Config(_))
    ));
    assert!(matches!(config(&[("SHMHEAP_SUPERBLOCK_SIZE", "64g")]), Err(Error::Config(_))));
    assert_eq!(config(&[("SHMHEAP_SUPERBLOCK_SIZE", "32g")]).unwrap().superblock_size, MAX_SUPERBLOCK_SIZE);

    // The file size cap is not a superblock size.
    assert!(config(&[("SHMHEAP_MAX_SIZE", "64g")]).is_ok());
    assert!(
      Config {
        superblock_size: 0,
        ..Config::default()
      }
      .validate()
      .is_err()
    );
  }

  #[test]
  fn sizes_accept_suffixes() {
    assert_eq!(parse_size("k", "4096").unwrap(), 4096);
    assert_eq!(parse_size("k", "2m").unwrap(), 2 << 20);
    assert_eq!(parse_size("k", "3K").unwrap(), 3 << 10);
    assert!(parse_size("k", "m").is_err());
  }
}
