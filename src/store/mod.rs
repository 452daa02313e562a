//! Shared runtime state.
//!
//! The current-value table is the single piece of state mutated by many
//! readers and one writer per `(device, tag)`.

mod table;

pub use table::{CurrentValueTable, TagKey};
