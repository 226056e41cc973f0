//! arith.rs — checked size/offset arithmetic
//!
//! Every size that comes out of an image header is attacker-controlled.
//! Nothing in the pipeline adds or rounds such values except through these
//! helpers, which fail with `IntegerOverflow` instead of wrapping.

use alloc::vec::Vec;

use crate::error::{BootError, BootResult};

/// Round `size` up to a multiple of `page`.
///
/// A zero `page` is rejected as a size error. A result that would not fit
/// in `u32` is an overflow: this is the "rounded to zero although the input
/// was not" case of the on-device arithmetic.
#[inline]
pub fn round_up(size: u32, page: u32, what: &'static str) -> BootResult<u32> {
    if page == 0 {
        return Err(BootError::MalformedSizes("page size is zero"));
    }
    let bumped = size
        .checked_add(page - 1)
        .ok_or(BootError::IntegerOverflow(what))?;
    Ok((bumped / page) * page)
}

#[inline]
pub fn add_u32(a: u32, b: u32, what: &'static str) -> BootResult<u32> {
    a.checked_add(b).ok_or(BootError::IntegerOverflow(what))
}

#[inline]
pub fn add_u64(a: u64, b: u64, what: &'static str) -> BootResult<u64> {
    a.checked_add(b).ok_or(BootError::IntegerOverflow(what))
}

#[inline]
pub fn sub_u64(a: u64, b: u64, what: &'static str) -> BootResult<u64> {
    a.checked_sub(b).ok_or(BootError::IntegerOverflow(what))
}

#[inline]
pub fn add_usize(a: usize, b: usize, what: &'static str) -> BootResult<usize> {
    a.checked_add(b).ok_or(BootError::IntegerOverflow(what))
}

#[inline]
pub fn mul_usize(a: usize, b: usize, what: &'static str) -> BootResult<usize> {
    a.checked_mul(b).ok_or(BootError::IntegerOverflow(what))
}

/// Sum a sequence of sizes, failing on the first wrap.
pub fn sum_u32(parts: &[u32], what: &'static str) -> BootResult<u32> {
    parts.iter().try_fold(0u32, |acc, &p| add_u32(acc, p, what))
}

/// `start..start+len` as a checked range, validated against `limit`.
pub fn span(start: usize, len: usize, limit: usize, what: &'static str) -> BootResult<core::ops::Range<usize>> {
    let end = add_usize(start, len, what)?;
    if end > limit {
        return Err(BootError::MalformedSizes(what));
    }
    Ok(start..end)
}

/// Widen a 64-bit address/length into `usize` for indexing.
#[inline]
pub fn to_usize(v: u64, what: &'static str) -> BootResult<usize> {
    usize::try_from(v).map_err(|_| BootError::IntegerOverflow(what))
}

/* ---------- fallible allocation ---------- */

/// Copy `data` into a fresh buffer, reporting allocator failure.
pub fn try_copy(data: &[u8], what: &'static str) -> BootResult<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(data.len())
        .map_err(|_| BootError::OutOfMemory(what))?;
    v.extend_from_slice(data);
    Ok(v)
}

/// Zero-filled buffer of `len` bytes, reporting allocator failure.
pub fn try_zeroed(len: usize, what: &'static str) -> BootResult<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| BootError::OutOfMemory(what))?;
    v.resize(len, 0);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_basic() {
        assert_eq!(round_up(0, 4096, "k").unwrap(), 0);
        assert_eq!(round_up(1, 4096, "k").unwrap(), 4096);
        assert_eq!(round_up(4096, 4096, "k").unwrap(), 4096);
        assert_eq!(round_up(4097, 2048, "k").unwrap(), 6144);
        // non power-of-two pages still round correctly
        assert_eq!(round_up(10, 3, "k").unwrap(), 12);
    }

    #[test]
    fn round_up_overflow_is_error() {
        let e = round_up(u32::MAX - 10, 4096, "kernel").unwrap_err();
        assert_eq!(e, BootError::IntegerOverflow("kernel"));
    }

    #[test]
    fn round_up_zero_page() {
        assert!(matches!(round_up(1, 0, "k"), Err(BootError::MalformedSizes(_))));
    }

    #[test]
    fn round_up_never_wraps() {
        // size != 0 must never come back as 0
        for page in [1u32, 2, 512, 2048, 4096, 16384, 65536] {
            for size in [1u32, page - 1 + 1, u32::MAX / 2, u32::MAX - page, u32::MAX] {
                match round_up(size, page, "x") {
                    Ok(r) => assert!(r >= size && r != 0),
                    Err(e) => assert_eq!(e, BootError::IntegerOverflow("x")),
                }
            }
        }
    }

    #[test]
    fn span_checks_limit_and_wrap() {
        assert_eq!(span(4, 4, 8, "s").unwrap(), 4..8);
        assert!(matches!(span(4, 5, 8, "s"), Err(BootError::MalformedSizes(_))));
        assert!(matches!(span(usize::MAX, 1, 8, "s"), Err(BootError::IntegerOverflow(_))));
    }

    #[test]
    fn sum_detects_wrap() {
        assert_eq!(sum_u32(&[1, 2, 3], "t").unwrap(), 6);
        assert!(sum_u32(&[u32::MAX, 1], "t").is_err());
    }
}
