//! Solvers driven by control sequences.
//!
//! A solver is an opaque state machine: it owns its [`Phase`], its iteration
//! counter and its [`Registry`]. Control sequences read the phase, run passes
//! of their branch, and call [`Solver::advance`] when a pass is done.

pub mod differential_corrector;
pub mod external;
pub mod finite_difference;
pub mod linalg;
pub mod optimizer;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bridge::EngineVerdict;
use crate::core::error::ControlError;
use crate::core::phase::Phase;
use crate::core::registry::Registry;
use crate::core::types::{EngineKind, RegistrationCounts, SequenceKind, SolverStatus};

pub use differential_corrector::DifferentialCorrector;
pub use external::{ExternalSettings, ExternalSolver};
pub use optimizer::Optimizer;

pub trait Solver: fmt::Debug {
    fn name(&self) -> &str;

    /// Script type name, e.g. `DifferentialCorrector`.
    fn type_name(&self) -> &'static str;

    fn engine_kind(&self) -> EngineKind;

    fn phase(&self) -> Phase;

    /// Completed iterations of the current run.
    fn iterations(&self) -> usize;

    fn status(&self) -> SolverStatus;

    fn registry(&self) -> &Registry;

    fn registry_mut(&mut self) -> &mut Registry;

    /// Push the build-time registration tally. Called before `initialize`.
    fn set_counts(&mut self, counts: RegistrationCounts) {
        self.registry_mut().set_counts(counts);
    }

    /// Verify registrations and size internal state.
    fn initialize(&mut self) -> Result<(), ControlError>;

    /// Back to `Initializing` with iteration count zero and variables at
    /// their initial values. Registrations are kept.
    fn reset(&mut self);

    /// Move to the next phase and return it.
    fn advance(&mut self) -> Result<Phase, ControlError>;

    /// Progress text produced since the last call.
    fn drain_progress(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Summary printed once the solver reaches `Finished`.
    fn final_report(&self) -> Vec<String> {
        let registry = self.registry();
        let mut lines = vec![
            format!(
                "*** {} {}: {}",
                self.type_name(),
                self.name(),
                self.status()
            ),
            format!("   iterationsTaken = {}", self.iterations()),
        ];
        for (spec, value) in registry.variable_specs().zip(registry.variable_values()) {
            lines.push(format!("   {} = {}", spec.name, value));
        }
        lines
    }

    /// Phase of the callback handshake, for solvers driven by an external engine.
    fn callback_phase(&self) -> Option<Phase> {
        None
    }

    /// Step the callback handshake. `candidate` carries the variable values
    /// the engine supplied, `None` when results are being handed back.
    fn advance_callback(&mut self, _candidate: Option<&[f64]>) -> Result<Phase, ControlError> {
        Err(ControlError::protocol(format!(
            "solver '{}' does not accept callbacks",
            self.name()
        )))
    }

    /// Record the verdict of an external engine run.
    fn finish_external(&mut self, _verdict: &EngineVerdict) -> Result<(), ControlError> {
        Err(ControlError::protocol(format!(
            "solver '{}' is not driven by an external engine",
            self.name()
        )))
    }
}

/// Defaults applied to solvers and worker commands that leave a field unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverDefaults {
    pub max_iterations: usize,
    pub perturbation: f64,
    pub tolerance: f64,
}

impl Default for SolverDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            perturbation: 1e-6,
            tolerance: 1e-8,
        }
    }
}

/// A solver as declared by `Create`: its type and settable fields.
///
/// Each control sequence builds its own solver instance from this template.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverConfig {
    DifferentialCorrector { max_iterations: usize },
    Optimizer {
        max_iterations: usize,
        tolerance: f64,
        feasibility_tolerance: f64,
    },
    External(ExternalSettings),
}

impl SolverConfig {
    pub fn from_type(type_name: &str, defaults: &SolverDefaults) -> Option<Self> {
        match type_name {
            "DifferentialCorrector" => Some(SolverConfig::DifferentialCorrector {
                max_iterations: defaults.max_iterations,
            }),
            "Optimizer" => Some(SolverConfig::Optimizer {
                max_iterations: defaults.max_iterations,
                tolerance: defaults.tolerance,
                feasibility_tolerance: defaults.tolerance,
            }),
            "ExternalOptimizer" => Some(SolverConfig::External(ExternalSettings::default())),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SolverConfig::DifferentialCorrector { .. } => "DifferentialCorrector",
            SolverConfig::Optimizer { .. } => "Optimizer",
            SolverConfig::External(_) => "ExternalOptimizer",
        }
    }

    /// Which sequence kinds may drive this solver.
    pub fn supports(&self, kind: SequenceKind) -> bool {
        matches!(
            (self, kind),
            (SolverConfig::DifferentialCorrector { .. }, SequenceKind::Target)
                | (SolverConfig::Optimizer { .. }, SequenceKind::Optimize)
                | (SolverConfig::External(_), SequenceKind::Optimize)
        )
    }

    /// Apply `Solver.Field = value` from a script.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match (self, field) {
            (
                SolverConfig::DifferentialCorrector { max_iterations }
                | SolverConfig::Optimizer { max_iterations, .. },
                "MaximumIterations",
            ) => *max_iterations = parse_count(value)?,
            (SolverConfig::Optimizer { tolerance, .. }, "Tolerance") => {
                *tolerance = parse_positive(value)?;
            }
            (
                SolverConfig::Optimizer {
                    feasibility_tolerance,
                    ..
                },
                "FeasibilityTolerance",
            ) => *feasibility_tolerance = parse_positive(value)?,
            (SolverConfig::External(settings), "Command") => {
                settings.command = Some(unquote(value).to_string());
            }
            (SolverConfig::External(settings), "RequestTimeout") => {
                let secs = value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| format!("RequestTimeout must be positive, got '{value}'"))?;
                settings.request_timeout_secs = Some(secs);
            }
            (config, field) => {
                return Err(format!("{} has no field '{field}'", config.type_name()));
            }
        }
        Ok(())
    }

    pub fn build(&self, name: &str) -> Box<dyn Solver> {
        match self {
            SolverConfig::DifferentialCorrector { max_iterations } => {
                Box::new(DifferentialCorrector::new(name, *max_iterations))
            }
            SolverConfig::Optimizer {
                max_iterations,
                tolerance,
                feasibility_tolerance,
            } => Box::new(Optimizer::new(
                name,
                *max_iterations,
                *tolerance,
                *feasibility_tolerance,
            )),
            SolverConfig::External(settings) => {
                Box::new(ExternalSolver::new(name, settings.clone()))
            }
        }
    }
}

fn parse_count(value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("expected a positive integer, got '{value}'"))
}

fn parse_positive(value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| format!("expected a positive number, got '{value}'"))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_types_pair_with_sequence_kinds() {
        let defaults = SolverDefaults::default();
        let dc = SolverConfig::from_type("DifferentialCorrector", &defaults).expect("dc");
        let ext = SolverConfig::from_type("ExternalOptimizer", &defaults).expect("ext");
        assert!(dc.supports(SequenceKind::Target));
        assert!(!dc.supports(SequenceKind::Optimize));
        assert!(ext.supports(SequenceKind::Optimize));
        assert!(SolverConfig::from_type("Propagator", &defaults).is_none());
    }

    #[test]
    fn fields_are_parsed_per_type() {
        let defaults = SolverDefaults::default();
        let mut opt = SolverConfig::from_type("Optimizer", &defaults).expect("opt");
        opt.set_field("MaximumIterations", "40").expect("iterations");
        opt.set_field("Tolerance", "1e-6").expect("tolerance");
        assert!(opt.set_field("Tolerance", "-1").is_err());
        assert!(opt.set_field("Command", "'x'").is_err());
        assert_eq!(
            opt,
            SolverConfig::Optimizer {
                max_iterations: 40,
                tolerance: 1e-6,
                feasibility_tolerance: 1e-8,
            }
        );

        let mut ext = SolverConfig::from_type("ExternalOptimizer", &defaults).expect("ext");
        ext.set_field("Command", "'secant-engine --tolerance 1e-10'")
            .expect("command");
        let SolverConfig::External(settings) = ext else {
            panic!("expected external settings");
        };
        assert_eq!(
            settings.command.as_deref(),
            Some("secant-engine --tolerance 1e-10")
        );
    }
}
