//! Public facade crate for `webmcts`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `webmcts-core`.

pub use webmcts_core::*;
