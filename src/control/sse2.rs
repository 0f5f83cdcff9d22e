#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

use super::BitMask;
use super::ControlBytes;
use super::EMPTY;
use super::Matcher;

/// SSE2 matcher: one compare and one `movemask` per query.
pub struct Sse2;

/// Load the group's control bytes into the low lanes of a vector.
///
/// For eight-lane groups only the low 8 bytes are loaded and the upper half
/// of the register is zero, so callers mask the result to the group width.
#[inline(always)]
fn load(ctrl: &ControlBytes) -> __m128i {
    // SAFETY: `ControlBytes` is `#[repr(C, align(16))]` with the byte array at
    // offset 0. A sixteen-lane group is exactly one aligned 16-byte load; an
    // eight-lane group reads only its own 8 bytes via `_mm_loadl_epi64`.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(feature = "sixteen-way")] {
                _mm_load_si128(ctrl.as_bytes().as_ptr() as *const __m128i)
            } else {
                _mm_loadl_epi64(ctrl.as_bytes().as_ptr() as *const __m128i)
            }
        }
    }
}

#[inline(always)]
fn movemask(v: __m128i) -> BitMask {
    // SAFETY: SSE2 is statically enabled for this module.
    BitMask::new(unsafe { _mm_movemask_epi8(v) } as u16)
}

impl Matcher for Sse2 {
    #[inline(always)]
    fn match_tag(ctrl: &ControlBytes, tag: u8) -> BitMask {
        debug_assert!(tag & EMPTY == 0);
        // SAFETY: SSE2 is statically enabled for this module.
        movemask(unsafe { _mm_cmpeq_epi8(load(ctrl), _mm_set1_epi8(tag as i8)) })
    }

    #[inline(always)]
    fn match_empty(ctrl: &ControlBytes) -> BitMask {
        // SAFETY: SSE2 is statically enabled for this module.
        movemask(unsafe { _mm_cmpeq_epi8(load(ctrl), _mm_set1_epi8(EMPTY as i8)) })
    }

    #[inline(always)]
    fn match_full(ctrl: &ControlBytes) -> BitMask {
        // The sign bit is set exactly on EMPTY and DELETED lanes. Zeroed upper
        // lanes of an eight-lane load read as full and are cut by the mask.
        BitMask::new(!movemask(load(ctrl)).bits())
    }
}
