//! Solver phases observed by control sequences.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::ControlError;

/// Externally observable step of a solver's iterative algorithm.
///
/// Owned by the solver. Control sequences read it and react; they never set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Initializing,
    Nominal,
    Perturbing,
    Calculating,
    CheckingRun,
    RunExternal,
    RunSpecial,
    Finished,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Initializing,
        Phase::Nominal,
        Phase::Perturbing,
        Phase::Calculating,
        Phase::CheckingRun,
        Phase::RunExternal,
        Phase::RunSpecial,
        Phase::Finished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Nominal => "Nominal",
            Phase::Perturbing => "Perturbing",
            Phase::Calculating => "Calculating",
            Phase::CheckingRun => "CheckingRun",
            Phase::RunExternal => "RunExternal",
            Phase::RunSpecial => "RunSpecial",
            Phase::Finished => "Finished",
        }
    }

    /// True for phases in which the branch runs one pass.
    pub fn runs_pass(self) -> bool {
        matches!(
            self,
            Phase::Nominal | Phase::Perturbing | Phase::RunSpecial | Phase::Finished
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| ControlError::Protocol {
                reason: format!("unknown phase '{s}'"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for phase in Phase::ALL {
            assert_eq!(phase.to_string().parse::<Phase>().expect("parse"), phase);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("Converging".parse::<Phase>().is_err());
    }
}
