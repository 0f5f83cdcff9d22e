//! Control bytes and the group match primitives.
//!
//! Every slot in the table has a one-byte control word:
//!
//! | State      | Byte          |
//! |------------|---------------|
//! | `EMPTY`    | `0b1000_0000` |
//! | `DELETED`  | `0b1111_1110` |
//! | Occupied   | `0b0ttt_tttt` |
//!
//! The high bit separates vacant lanes from occupied ones, and the low seven
//! bits of an occupied byte hold the H2 tag of the key stored in that lane.
//! A [`Matcher`] compares a whole group of control bytes against a query in
//! one pass and reports the matching lanes as a [`BitMask`].

use core::fmt::Debug;

use crate::group::GROUP_WIDTH;

mod portable;
#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "sse2"
))]
mod sse2;

pub use portable::Portable;
#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    target_feature = "sse2"
))]
pub use sse2::Sse2;

/// Control byte of a lane that has never held a key since the last clear or
/// rehash.
///
/// A group containing at least one `EMPTY` lane terminates a probe.
pub const EMPTY: u8 = 0b1000_0000;

/// Control byte of a lane whose key was removed while its group had no
/// `EMPTY` lane. Probes continue past it.
pub const DELETED: u8 = 0b1111_1110;

/// Number of hash bits stored in the control byte.
const TAG_BITS: u32 = 7;

/// Group-selection part of a hash: every bit above the tag.
#[inline(always)]
pub(crate) fn h1(hash: u64) -> u64 {
    hash >> TAG_BITS
}

/// The 7-bit tag stored in an occupied control byte.
#[inline(always)]
pub(crate) fn h2(hash: u64) -> u8 {
    (hash & 0x7f) as u8
}

/// `true` if the byte marks a lane holding a live key.
#[inline(always)]
pub(crate) fn is_full(ctrl: u8) -> bool {
    ctrl & EMPTY == 0
}

/// The control bytes of a single group.
///
/// The array is 16-byte aligned so the SSE2 backend can use aligned loads.
/// The portable backend reads it as consecutive little-endian `u64` words,
/// lane `i` of a word occupying bits `8 * i .. 8 * i + 8`; it never
/// reinterprets the memory, so the packing is identical on every target.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct ControlBytes([u8; GROUP_WIDTH]);

impl ControlBytes {
    /// A group with every lane `EMPTY`.
    pub const EMPTY: Self = Self([EMPTY; GROUP_WIDTH]);

    /// Builds a control group from raw bytes.
    pub const fn from_bytes(bytes: [u8; GROUP_WIDTH]) -> Self {
        Self(bytes)
    }

    /// The raw control bytes, one per lane.
    pub const fn as_bytes(&self) -> &[u8; GROUP_WIDTH] {
        &self.0
    }

    #[inline(always)]
    pub(crate) fn get(&self, lane: usize) -> u8 {
        self.0[lane]
    }

    #[inline(always)]
    pub(crate) fn set(&mut self, lane: usize, ctrl: u8) {
        self.0[lane] = ctrl;
    }
}

impl Debug for ControlBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (lane, &ctrl) in self.0.iter().enumerate() {
            if lane != 0 {
                f.write_str(", ")?;
            }
            match ctrl {
                EMPTY => f.write_str("..")?,
                DELETED => f.write_str("xx")?,
                tag => write!(f, "{tag:02x}")?,
            }
        }
        Ok(())
    }
}

/// A set of lanes within one group, bit `i` standing for lane `i`.
///
/// Iterating a mask yields the lanes in increasing order. That order is an
/// artifact of the encoding; callers must not attach meaning to it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitMask(u16);

impl BitMask {
    /// Mask covering every lane of a group.
    pub const ALL: Self = Self((((1u32) << GROUP_WIDTH) - 1) as u16);

    /// Wraps raw lane bits. Bits at or above `GROUP_WIDTH` are discarded.
    #[inline(always)]
    pub const fn new(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// The raw lane bits.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// `true` if at least one lane is set.
    #[inline(always)]
    pub const fn any(self) -> bool {
        self.0 != 0
    }

    /// Lowest set lane, if any.
    #[inline(always)]
    pub const fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Splits off the lowest set lane, returning it with the remaining lanes.
    #[inline(always)]
    pub const fn next_set_bit(self) -> Option<(usize, BitMask)> {
        match self.lowest() {
            Some(lane) => Some((lane, BitMask(self.0 & (self.0 - 1)))),
            None => None,
        }
    }
}

impl Iterator for BitMask {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        let (lane, rest) = self.next_set_bit()?;
        *self = rest;
        Some(lane)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for BitMask {}

impl Debug for BitMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BitMask({:0width$b})", self.0, width = GROUP_WIDTH)
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Portable {}

    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2"
    ))]
    impl Sealed for super::Sse2 {}
}

/// Whole-group match primitives over [`ControlBytes`].
///
/// A table is instantiated with exactly one matcher and never mixes
/// backends. Every implementation must return bit-for-bit identical masks
/// for identical inputs.
pub trait Matcher: sealed::Sealed {
    /// Lanes whose control byte is `Occupied(tag)`. `tag` must have its high
    /// bit clear.
    fn match_tag(ctrl: &ControlBytes, tag: u8) -> BitMask;

    /// Lanes whose control byte is `EMPTY`.
    fn match_empty(ctrl: &ControlBytes) -> BitMask;

    /// Lanes holding a live key (high bit clear).
    fn match_full(ctrl: &ControlBytes) -> BitMask;
}

cfg_if::cfg_if! {
    if #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2",
        not(miri)
    ))] {
        /// The match backend used when none is named explicitly.
        pub type DefaultMatcher = Sse2;
    } else {
        /// The match backend used when none is named explicitly.
        pub type DefaultMatcher = Portable;
    }
}
