//! Control layer for iterative solvers in mission scripts.
//!
//! A `Target` or `Optimize` sequence wraps a block of mission commands (its
//! branch) and repeatedly runs it under the direction of a solver until the
//! solver finishes. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic building blocks (phases, objects,
//!   registration bookkeeping, the branch arena). No I/O.
//! - **[`io`]**: Side-effecting operations (config files, engine processes,
//!   run summaries).
//!
//! Orchestration modules ([`sequence`], [`mission`], [`script`], [`session`])
//! tie solvers, branches and the external engine [`bridge`] together.

pub mod bridge;
pub mod command;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mission;
pub mod script;
pub mod sequence;
pub mod session;
pub mod solver;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
