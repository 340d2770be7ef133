//! Shared deterministic types for the control core.
//!
//! These types define stable contracts between the branch, the registry and
//! the solvers. They hold no I/O state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::ControlError;

/// Role a worker command plays when it registers with a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Variable,
    Objective,
    EqualityConstraint,
    InequalityConstraint,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Variable => "Variable",
            Role::Objective => "Objective",
            Role::EqualityConstraint => "EqualityConstraint",
            Role::InequalityConstraint => "InequalityConstraint",
        }
    }

    pub fn is_result(self) -> bool {
        !matches!(self, Role::Variable)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Variable" => Ok(Role::Variable),
            "Objective" => Ok(Role::Objective),
            "EqualityConstraint" | "Equality" => Ok(Role::EqualityConstraint),
            "InequalityConstraint" | "Inequality" => Ok(Role::InequalityConstraint),
            other => Err(ControlError::UnknownResultKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Stable integer handle returned by registration.
///
/// Variables and results are numbered independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registration tallies pushed into a solver before it initializes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationCounts {
    pub variables: usize,
    pub objectives: usize,
    pub equalities: usize,
    pub inequalities: usize,
}

impl RegistrationCounts {
    pub fn add(&mut self, role: Role) {
        match role {
            Role::Variable => self.variables += 1,
            Role::Objective => self.objectives += 1,
            Role::EqualityConstraint => self.equalities += 1,
            Role::InequalityConstraint => self.inequalities += 1,
        }
    }

    pub fn constraints(&self) -> usize {
        self.equalities + self.inequalities
    }
}

/// Which kind of control sequence owns a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceKind {
    Target,
    Optimize,
}

impl SequenceKind {
    pub fn open_keyword(self) -> &'static str {
        match self {
            SequenceKind::Target => "Target",
            SequenceKind::Optimize => "Optimize",
        }
    }

    pub fn close_keyword(self) -> &'static str {
        match self {
            SequenceKind::Target => "EndTarget",
            SequenceKind::Optimize => "EndOptimize",
        }
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.open_keyword())
    }
}

/// Where a solver's stepping decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    Internal,
    External,
}

/// Result of one cooperative `step()` of a control sequence or command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More steps are needed; call again.
    Running,
    /// The command finished for this run.
    Complete,
}

/// Terminal status a solver reports once it reaches `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    /// Still iterating.
    Running,
    Converged,
    ExceededIterations,
    /// External engine returned without convergence.
    EngineStopped,
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolverStatus::Running => "running",
            SolverStatus::Converged => "converged",
            SolverStatus::ExceededIterations => "exceeded maximum iterations",
            SolverStatus::EngineStopped => "external engine stopped without convergence",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_short_and_long_names() {
        assert_eq!(
            "Equality".parse::<Role>().expect("parse"),
            Role::EqualityConstraint
        );
        assert_eq!(
            "InequalityConstraint".parse::<Role>().expect("parse"),
            Role::InequalityConstraint
        );
    }

    #[test]
    fn unknown_result_kind_is_an_error() {
        let err = "Goal".parse::<Role>().unwrap_err();
        assert!(matches!(err, ControlError::UnknownResultKind { kind } if kind == "Goal"));
    }

    #[test]
    fn counts_tally_by_role() {
        let mut counts = RegistrationCounts::default();
        for role in [
            Role::Variable,
            Role::Variable,
            Role::Objective,
            Role::EqualityConstraint,
            Role::InequalityConstraint,
        ] {
            counts.add(role);
        }
        assert_eq!(counts.variables, 2);
        assert_eq!(counts.objectives, 1);
        assert_eq!(counts.constraints(), 2);
    }
}
