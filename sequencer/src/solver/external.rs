//! Solver whose stepping decisions are made by an external engine.
//!
//! The outer phase only ever goes `Initializing -> RunExternal -> Finished`.
//! While the engine runs, each callback drives a nested handshake phase:
//! `Initializing -> Nominal -> Calculating -> Nominal -> ...`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::EngineVerdict;
use crate::core::error::ControlError;
use crate::core::phase::Phase;
use crate::core::registry::Registry;
use crate::core::types::{EngineKind, SolverStatus};
use crate::solver::Solver;

/// Script-level settings of an `ExternalOptimizer`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSettings {
    /// Program (with arguments) to launch; falls back to the configured engine.
    pub command: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug)]
pub struct ExternalSolver {
    name: String,
    settings: ExternalSettings,
    registry: Registry,
    phase: Phase,
    nested: Phase,
    callbacks: usize,
    status: SolverStatus,
    message: Option<String>,
}

impl ExternalSolver {
    pub fn new(name: &str, settings: ExternalSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
            registry: Registry::new(),
            phase: Phase::Initializing,
            nested: Phase::Initializing,
            callbacks: 0,
            status: SolverStatus::Running,
            message: None,
        }
    }

    pub fn settings(&self) -> &ExternalSettings {
        &self.settings
    }

    fn out_of_turn(&self, what: &str) -> ControlError {
        ControlError::protocol(format!(
            "{what} while solver '{}' is in callback phase {}",
            self.name, self.nested
        ))
    }
}

impl Solver for ExternalSolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "ExternalOptimizer"
    }

    fn engine_kind(&self) -> EngineKind {
        EngineKind::External
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed callbacks stand in for iterations.
    fn iterations(&self) -> usize {
        self.callbacks
    }

    fn status(&self) -> SolverStatus {
        self.status
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn initialize(&mut self) -> Result<(), ControlError> {
        self.registry.check_counts(&self.name)?;
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.phase = Phase::Initializing;
        self.nested = Phase::Initializing;
        self.callbacks = 0;
        self.status = SolverStatus::Running;
        self.message = None;
        self.registry.reset_values();
    }

    fn advance(&mut self) -> Result<Phase, ControlError> {
        let next = match self.phase {
            Phase::Initializing => Phase::RunExternal,
            // Left only through `finish_external`.
            Phase::RunExternal => Phase::RunExternal,
            Phase::Finished => Phase::Finished,
            phase => {
                return Err(ControlError::UnexpectedPhase {
                    solver: self.name.clone(),
                    phase,
                    engine: "external",
                });
            }
        };
        debug!(solver = %self.name, from = %self.phase, to = %next, "advance");
        self.phase = next;
        Ok(next)
    }

    fn final_report(&self) -> Vec<String> {
        let mut lines = vec![
            format!("*** {} {}: {}", self.type_name(), self.name, self.status),
            format!("   iterationsTaken = {}", self.callbacks),
        ];
        if let Some(message) = &self.message {
            lines.push(format!("   engine: {message}"));
        }
        for (spec, value) in self
            .registry
            .variable_specs()
            .zip(self.registry.variable_values())
        {
            lines.push(format!("   {} = {}", spec.name, value));
        }
        lines
    }

    fn callback_phase(&self) -> Option<Phase> {
        Some(self.nested)
    }

    fn advance_callback(&mut self, candidate: Option<&[f64]>) -> Result<Phase, ControlError> {
        if self.phase != Phase::RunExternal {
            return Err(ControlError::protocol(format!(
                "callback received while solver '{}' is in phase {}",
                self.name, self.phase
            )));
        }
        let next = match (self.nested, candidate) {
            (Phase::Initializing, Some(values)) => {
                self.registry.set_variable_values(values)?;
                Phase::Nominal
            }
            (Phase::Nominal, Some(values)) => {
                self.registry.set_variable_values(values)?;
                Phase::Calculating
            }
            (Phase::Calculating, None) => {
                self.callbacks += 1;
                Phase::Nominal
            }
            (_, Some(_)) => return Err(self.out_of_turn("candidate values supplied")),
            (_, None) => return Err(self.out_of_turn("results requested")),
        };
        debug!(solver = %self.name, from = %self.nested, to = %next, "callback phase");
        self.nested = next;
        Ok(next)
    }

    fn finish_external(&mut self, verdict: &EngineVerdict) -> Result<(), ControlError> {
        if self.phase != Phase::RunExternal {
            return Err(ControlError::protocol(format!(
                "engine verdict received while solver '{}' is in phase {}",
                self.name, self.phase
            )));
        }
        if let Some(best) = &verdict.best {
            self.registry.set_variable_values(best)?;
        }
        self.status = if verdict.converged {
            SolverStatus::Converged
        } else {
            SolverStatus::EngineStopped
        };
        self.message = verdict.message.clone();
        info!(
            solver = %self.name,
            status = %self.status,
            callbacks = self.callbacks,
            "external engine finished"
        );
        self.phase = Phase::Finished;
        Ok(())
    }
}
