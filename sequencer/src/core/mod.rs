//! Deterministic, in-memory building blocks of the sequencer.
//!
//! Core modules have no I/O. They hold the phase vocabulary, the object
//! store, solver registration bookkeeping and the branch arena, and return
//! typed [`error::ControlError`]s that the orchestration layer reports.

pub mod branch;
pub mod error;
pub mod expr;
pub mod objects;
pub mod phase;
pub mod registry;
pub mod snapshot;
pub mod types;
