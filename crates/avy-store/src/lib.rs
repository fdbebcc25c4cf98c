//! Durable record store for crash recovery.
//!
//! One JSON file per record under `{root}/{collection}/{key}.json`,
//! written under an exclusive `flock(2)` so concurrent processes never
//! interleave a truncate-rewrite. The contract is the record schema the
//! services put into it, not this storage engine; anything that can hold
//! one JSON document per key would do.

pub mod store;

pub use store::{RecordStore, collections};
