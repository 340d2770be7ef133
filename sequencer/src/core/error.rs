//! Error taxonomy for building and running control sequences.
//!
//! None of these are retried. Build-time errors abort sequence construction,
//! registration and protocol errors abort the current run; the caller restarts
//! from a clean state.

use thiserror::Error;

use crate::core::phase::Phase;
use crate::core::types::{Handle, Role, SequenceKind};

#[derive(Debug, Error)]
pub enum ControlError {
    // Build-time / configuration.
    #[error("solver '{name}' is not defined")]
    MissingSolver { name: String },

    #[error("'{name}' is a {actual}, but {kind} needs a {expected}")]
    WrongSolverType {
        name: String,
        kind: SequenceKind,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{command} addresses solver '{addressed}' inside a sequence driven by '{owner}'")]
    SolverMismatch {
        command: &'static str,
        addressed: String,
        owner: String,
    },

    #[error("{count} objectives at nesting depth {depth} (at most depth + 1 allowed)")]
    ObjectiveLimit { count: usize, depth: usize },

    #[error("{found} cannot close a {open} sequence")]
    MismatchedClose {
        open: SequenceKind,
        found: SequenceKind,
    },

    #[error("{kind} sequence is already closed")]
    BranchClosed { kind: SequenceKind },

    #[error("{kind} sequence was never closed")]
    BranchNotClosed { kind: SequenceKind },

    #[error("{command} is not allowed inside a {kind} sequence")]
    CommandNotAllowed {
        command: &'static str,
        kind: SequenceKind,
    },

    #[error("script line {line}: {reason}")]
    Script { line: usize, reason: String },

    // Registration.
    #[error("unknown result kind '{kind}'")]
    UnknownResultKind { kind: String },

    #[error("{role} handle {handle} is out of range (registered: {len})")]
    HandleOutOfRange {
        handle: Handle,
        role: Role,
        len: usize,
    },

    #[error("handle {handle} was registered as {registered}, not {reported}")]
    RoleMismatch {
        handle: Handle,
        registered: Role,
        reported: Role,
    },

    #[error("objective '{name}' conflicts with objective '{existing}' at nesting level {level}")]
    DuplicateObjective {
        name: String,
        existing: String,
        level: usize,
    },

    #[error("variable '{name}' is already registered")]
    DuplicateVariable { name: String },

    #[error("{command} executed before it registered with its solver")]
    Unregistered { command: &'static str },

    #[error("solver '{solver}' expected {expected} {role} registrations, got {actual}")]
    CountMismatch {
        solver: String,
        role: &'static str,
        expected: usize,
        actual: usize,
    },

    // Protocol.
    #[error("callback protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("solver '{solver}' needs an external engine, but none is attached")]
    EngineUnavailable { solver: String },

    #[error("callback payload: {reason}")]
    Payload { reason: String },

    #[error("interrupted by user")]
    Interrupted,

    // Internal.
    #[error("solver '{solver}' reported phase {phase}, which a {engine} sequence cannot dispatch")]
    UnexpectedPhase {
        solver: String,
        phase: Phase,
        engine: &'static str,
    },

    #[error("solver '{solver}' produced a singular system at iteration {iteration}")]
    SingularSystem { solver: String, iteration: usize },

    #[error("unknown object or parameter '{name}'")]
    UnknownObject { name: String },

    #[error("cannot evaluate '{expr}': {reason}")]
    Evaluation { expr: String, reason: String },

    #[error("{command} did not complete within {limit} steps")]
    StepLimit { command: &'static str, limit: u64 },

    #[error("loop snapshot reset requested before any snapshot was stored")]
    SnapshotMissing,

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl ControlError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        ControlError::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn payload(reason: impl Into<String>) -> Self {
        ControlError::Payload {
            reason: reason.into(),
        }
    }
}
