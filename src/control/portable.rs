use super::BitMask;
use super::ControlBytes;
use super::EMPTY;
use super::Matcher;
use crate::group::GROUP_WIDTH;

const WORD_LANES: usize = 8;
const WORDS: usize = GROUP_WIDTH / WORD_LANES;

const LSB: u64 = 0x0101_0101_0101_0101;
const MSB: u64 = 0x8080_8080_8080_8080;

/// Moves bit 7 of every byte to bit `56 + byte index`. The partial products
/// never overlap, so there are no carries into the top byte.
const COMPRESS: u64 = 0x0102_0408_1020_4080;

/// Word-at-a-time matcher that works on any target.
///
/// Control bytes are packed eight to a little-endian `u64`. Each query XORs
/// the word against the broadcast needle and runs an exact zero-byte test,
/// leaving bit 7 set in every matching byte, which is then gathered into one
/// bit per lane.
pub struct Portable;

#[inline(always)]
fn word(ctrl: &ControlBytes, index: usize) -> u64 {
    let mut bytes = [0u8; WORD_LANES];
    bytes.copy_from_slice(&ctrl.as_bytes()[index * WORD_LANES..(index + 1) * WORD_LANES]);
    u64::from_le_bytes(bytes)
}

/// Bit 7 set in each byte of `word` that is zero.
///
/// Adding `0x7f` to the low seven bits cannot carry out of the byte, so
/// unlike the classic `(x - 0x01) & !x` test there are no false positives
/// next to a real match.
#[inline(always)]
fn zero_bytes(word: u64) -> u64 {
    !(((word & !MSB).wrapping_add(!MSB)) | word) & MSB
}

#[inline(always)]
fn compress(msbs: u64) -> u16 {
    ((msbs >> 7).wrapping_mul(COMPRESS) >> 56) as u16
}

#[inline(always)]
fn gather(ctrl: &ControlBytes, per_word: impl Fn(u64) -> u64) -> BitMask {
    let mut bits = 0u16;
    for index in 0..WORDS {
        bits |= compress(per_word(word(ctrl, index))) << (index * WORD_LANES);
    }
    BitMask::new(bits)
}

impl Matcher for Portable {
    #[inline(always)]
    fn match_tag(ctrl: &ControlBytes, tag: u8) -> BitMask {
        debug_assert!(tag & EMPTY == 0);
        let needle = LSB.wrapping_mul(tag as u64);
        gather(ctrl, |w| zero_bytes(w ^ needle))
    }

    #[inline(always)]
    fn match_empty(ctrl: &ControlBytes) -> BitMask {
        let needle = LSB.wrapping_mul(EMPTY as u64);
        gather(ctrl, |w| zero_bytes(w ^ needle))
    }

    #[inline(always)]
    fn match_full(ctrl: &ControlBytes) -> BitMask {
        gather(ctrl, |w| !w & MSB)
    }
}
