#![allow(unstable_name_collisions)]
#![deny(unsafe_op_in_unsafe_fn)]

//! A wait-free, linearizable hash table with insertion-ordered snapshots.
//!
//! The centerpiece is [`Table`], an open-addressed concurrent hash table
//! keyed by caller-supplied [128-bit hashes](HashValue). Each bucket keeps
//! a small history of modification records, and every committed write
//! advances a process-wide epoch counter and is stamped with the result.
//! That epoch stamp is the write's linearization point; it gives reads a
//! single consistent cut of the table, totally orders writes to the same
//! key, and lets [`Table::view`] produce snapshots sorted by insertion.
//!
//! Progress does not depend on other threads being scheduled: writers that
//! lose an install race combine with the winner instead of retrying,
//! readers commit stalled writes on the writers' behalf, and store
//! migrations are cooperative, with every thread able to finish any other
//! thread's share of the copy.
//!
//! Memory reclamation is handled by the [`ebr`] module, the epoch-based
//! scheme the table is built around. It is exposed for building other
//! concurrent structures with the same guarantees.
//!
//! # Usage
//!
//! Operations take a [`Guard`], which pins the current thread's epoch
//! reservation and keeps every reference read under it valid:
//!
//! ```
//! use strata::{HashValue, Table};
//!
//! let table = Table::new();
//! let guard = table.guard();
//!
//! let key = HashValue::new(0x5eed).unwrap();
//! table.insert(key, "value", &guard);
//! assert_eq!(table.get(key, &guard), Some(&"value"));
//! ```
//!
//! The table does not hash: callers bring their own 128-bit hash values
//! and the hash alone identifies the key. Wrappers that own keys are
//! expected to hash them (and to manage displaced values, which every
//! mutating operation reports back).

mod map;
mod raw;

pub mod ebr;

pub use ebr::Guard;
pub use map::{HashValue, OccupiedError, Table, View, ViewEntry};
