//! Stable exit codes for sequencer CLI commands.

/// Mission ran and every control sequence converged, or the script checked clean.
pub const OK: i32 = 0;
/// Invalid script/config, engine failure or any other error.
pub const INVALID: i32 = 1;
/// Mission ran to the end but at least one control sequence did not converge.
pub const NOT_CONVERGED: i32 = 2;
