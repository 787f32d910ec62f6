//! Re-exports the shared store error type.
//!
//! Every subsystem in this crate (store, branch, lock, migration) surfaces
//! the same `StoreError` kinds from `session-domain` (spec §7) rather than
//! keeping a narrow per-module enum — there is only one caller-facing error
//! surface here, so a second layer of conversion would just be ceremony.

pub use session_domain::{Result, StoreError};
