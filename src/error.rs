//! Error types for the shared-memory heap.

use thiserror::Error;

/// Result type alias using the heap's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  /// The backing file could not grow (size cap reached or storage full).
  #[error("shared memory exhausted: {0}")]
  OutOfSpace(String),

  /// A block handle did not resolve to a valid block.
  #[error("invalid block handle: superblock {superblock}, block {block}")]
  InvalidHandle { superblock: usize, block: usize },

  /// Heap file magic/version mismatch, or a superblock header that does not validate.
  #[error("incompatible heap file {name}: {reason}")]
  Incompatible { name: String, reason: String },

  /// A structural check over shared metadata failed.
  #[error("corrupt superblock: {0}")]
  Corrupt(String),

  #[error("heap file {0} is already open")]
  AlreadyOpen(String),

  #[error("heap file {0} is not open")]
  NotOpen(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}
