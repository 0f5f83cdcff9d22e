//! Keyed hashing that the table can re-key on every rehash.

use core::hash::BuildHasher;
use core::hash::BuildHasherDefault;

/// A [`BuildHasher`] whose key can be replaced.
///
/// Tables call [`reseed`](ReseedableHasher::reseed) when they are created and
/// again on every rehash, so a sequence of keys crafted to collide under one
/// key does not keep colliding after the table grows. Hashing must be
/// deterministic between two calls to `reseed`.
pub trait ReseedableHasher: BuildHasher {
    /// Replace the hashing key with one derived from `seed`.
    fn reseed(&mut self, seed: u64);
}

#[cfg(feature = "foldhash")]
impl ReseedableHasher for foldhash::fast::FixedState {
    #[inline]
    fn reseed(&mut self, seed: u64) {
        *self = foldhash::fast::FixedState::with_seed(seed);
    }
}

/// `std`'s random state cannot be keyed explicitly, so reseeding draws a
/// fresh random state and ignores `seed`.
#[cfg(feature = "std")]
impl ReseedableHasher for std::hash::RandomState {
    #[inline]
    fn reseed(&mut self, _seed: u64) {
        *self = std::hash::RandomState::new();
    }
}

/// Unkeyed hashers have nothing to reseed.
impl<H> ReseedableHasher for BuildHasherDefault<H>
where
    H: core::hash::Hasher + Default,
{
    #[inline]
    fn reseed(&mut self, _seed: u64) {}
}

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// The hasher used when none is named explicitly.
        pub type DefaultHashBuilder = foldhash::fast::FixedState;
    } else if #[cfg(feature = "std")] {
        /// The hasher used when none is named explicitly.
        pub type DefaultHashBuilder = std::hash::RandomState;
    } else {
        /// Placeholder when neither `foldhash` nor `std` is enabled. It has no
        /// values, so tables must be built with an explicit hasher.
        #[derive(Clone, Copy, Debug)]
        pub enum DefaultHashBuilder {}

        #[allow(deprecated)]
        impl BuildHasher for DefaultHashBuilder {
            type Hasher = core::hash::SipHasher;

            fn build_hasher(&self) -> Self::Hasher {
                match *self {}
            }
        }

        impl ReseedableHasher for DefaultHashBuilder {
            fn reseed(&mut self, _seed: u64) {
                match *self {}
            }
        }
    }
}

/// Seed for a table's random source when the caller does not supply one.
///
/// Draws from the OS under `std`. Without `std`, or when the OS read fails,
/// the seed is a fixed constant folded with the address of a stack local,
/// which is weak entropy: callers that need unpredictable tables there
/// should seed them with [`HashTable::with_capacity_hasher_and_seed`].
///
/// [`HashTable::with_capacity_hasher_and_seed`]: crate::HashTable::with_capacity_hasher_and_seed
pub(crate) fn entropy_seed() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            use rand::TryRngCore;

            rand::rngs::OsRng
                .try_next_u64()
                .unwrap_or_else(|_| fallback_seed())
        } else {
            fallback_seed()
        }
    }
}

#[inline(never)]
fn fallback_seed() -> u64 {
    let marker = 0u8;
    let addr = core::hint::black_box(core::ptr::addr_of!(marker)) as usize as u64;
    FALLBACK_SEED ^ addr.rotate_left(29).wrapping_mul(0xbf58_476d_1ce4_e5b9)
}

const FALLBACK_SEED: u64 = 0x9e37_79b9_7f4a_7c15;
