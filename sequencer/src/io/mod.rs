//! Side-effecting helpers: configuration files, engine processes, run summaries.

pub mod config;
pub mod engine;
pub mod summary;
