//! Shared test helpers for end-to-end tests.
//!
//! Note: We use `helpers/mod.rs` instead of `helpers.rs` + `helpers/`
//! because Cargo auto-discovers top-level `.rs` files in `tests/` as
//! integration tests.

pub mod front_end;
pub mod oracle;
