//! Offset addressing.
//!
//! A heap file is mapped at a different address in every process, so nothing
//! stored inside it may hold an absolute pointer. Structures refer to each
//! other by byte offset (or quantum offset) from a known base, and the offset
//! is resolved against the local mapping at dereference time.

/// Allocation quantum. Every block size and block offset is a multiple of it,
/// which keeps the atomic fields of block headers naturally aligned.
pub const QUANTUM: usize = 16;

const _: () = assert!(QUANTUM.is_power_of_two());

/// Resolves `offset` bytes past `base` as a typed location.
#[inline(always)]
pub unsafe fn offset_ptr<T>(base: *const u8, offset: usize) -> *mut T {
  unsafe { base.add(offset) as *mut T }
}

/// Byte distance from `base` to `ptr`. `ptr` must not precede `base`.
#[inline(always)]
pub fn offset_of<T>(base: *const u8, ptr: *const T) -> usize {
  debug_assert!(ptr as usize >= base as usize);
  ptr as usize - base as usize
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub const fn bytes_to_quanta(bytes: usize) -> usize {
  bytes.div_ceil(QUANTUM)
}

#[inline(always)]
pub const fn quanta_to_bytes(quanta: usize) -> usize {
  quanta * QUANTUM
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn offsets_resolve_against_any_base() {
    let a = [0u64; 8];
    let b = [0u64; 8];
    let base_a = a.as_ptr() as *const u8;
    let base_b = b.as_ptr() as *const u8;

    let in_a: *mut u64 = unsafe { offset_ptr(base_a, 24) };
    assert_eq!(offset_of(base_a, in_a), 24);

    // The same offset names the same slot in a different view.
    let in_b: *mut u64 = unsafe { offset_ptr(base_b, offset_of(base_a, in_a)) };
    assert_eq!(in_b as usize - base_b as usize, 24);
  }

  #[test]
  fn quantum_rounding() {
    assert_eq!(bytes_to_quanta(0), 0);
    assert_eq!(bytes_to_quanta(1), 1);
    assert_eq!(bytes_to_quanta(16), 1);
    assert_eq!(bytes_to_quanta(17), 2);
    assert_eq!(quanta_to_bytes(3), 48);
    assert_eq!(align_up(4097, 4096), 8192);
    assert_eq!(align_up(4096, 4096), 4096);
  }
}
