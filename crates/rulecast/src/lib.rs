//! Public facade crate for `rulecast`.
//!
//! This crate intentionally contains no IO or backend-specific logic.
//! It re-exports the backend-agnostic types/traits from `rulecast-core`.

pub use rulecast_core::*;
