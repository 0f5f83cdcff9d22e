#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod control;
mod group;

/// The Swiss table: groups of control bytes and key slots, probed a group at
/// a time.
pub mod hash_table;

/// A hash set backed by the Swiss table.
///
/// This module provides a `HashSet` that wraps the `HashTable` and provides
/// a standard set interface with configurable hashers.
pub mod hash_set;

pub mod hasher;

#[cfg(any(test, feature = "stats"))]
pub mod stats;

pub use control::DefaultMatcher;
pub use group::GROUP_WIDTH;
pub use group::MAX_AVG_GROUP_LOAD;
pub use hash_set::HashSet;
pub use hash_table::HashTable;
pub use hasher::DefaultHashBuilder;
pub use hasher::ReseedableHasher;
