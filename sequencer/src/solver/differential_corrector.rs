//! Newton targeter: drives equality goals to their targets.
//!
//! One iteration is a nominal pass, one perturbed pass per variable, and a
//! Newton step `J dx = -r` limited by each variable's `MaxStep` and bounds.

use tracing::{debug, info, instrument};

use crate::core::error::ControlError;
use crate::core::phase::Phase;
use crate::core::registry::{Registry, VariableSpec};
use crate::core::types::{EngineKind, Role, SolverStatus};
use crate::solver::Solver;
use crate::solver::finite_difference::ForwardDifference;
use crate::solver::linalg;

#[derive(Debug)]
pub struct DifferentialCorrector {
    name: String,
    max_iterations: usize,
    registry: Registry,
    phase: Phase,
    iterations: usize,
    status: SolverStatus,
    sweep: ForwardDifference,
    progress: Vec<String>,
}

impl DifferentialCorrector {
    pub fn new(name: &str, max_iterations: usize) -> Self {
        Self {
            name: name.to_string(),
            max_iterations,
            registry: Registry::new(),
            phase: Phase::Initializing,
            iterations: 0,
            status: SolverStatus::Running,
            sweep: ForwardDifference::default(),
            progress: Vec::new(),
        }
    }

    fn residuals(&self) -> Result<Vec<(f64, f64)>, ControlError> {
        let residuals = self.registry.equality_residuals();
        if let Some((spec, _)) = self
            .registry
            .result_specs()
            .filter(|spec| spec.role == Role::EqualityConstraint)
            .zip(&residuals)
            .find(|(_, (r, _))| r.is_nan())
        {
            return Err(ControlError::protocol(format!(
                "goal '{}' was not reported during the pass",
                spec.name
            )));
        }
        Ok(residuals)
    }

    fn record_nominal(&mut self) -> Result<(), ControlError> {
        let residuals: Vec<f64> = self.residuals()?.into_iter().map(|(r, _)| r).collect();
        let x = self.registry.variable_values();
        self.progress.push(format!(
            "{} iteration {}: variables [{}] goals [{}]",
            self.name,
            self.iterations,
            join(&x),
            join(&residuals)
        ));
        let specs: Vec<VariableSpec> = self.registry.variable_specs().cloned().collect();
        self.sweep = ForwardDifference::begin(x, residuals, &specs);
        Ok(())
    }

    fn check(&mut self) -> Result<Phase, ControlError> {
        let residuals = self.residuals()?;
        if residuals.iter().all(|(r, tol)| r.abs() <= *tol) {
            info!(solver = %self.name, iterations = self.iterations, "converged");
            self.status = SolverStatus::Converged;
            return Ok(Phase::Finished);
        }
        if self.iterations >= self.max_iterations {
            info!(
                solver = %self.name,
                max_iterations = self.max_iterations,
                "iteration limit reached"
            );
            self.status = SolverStatus::ExceededIterations;
            return Ok(Phase::Finished);
        }
        if self.sweep.is_complete() {
            return Ok(Phase::Calculating);
        }
        self.registry
            .set_variable_values(&self.sweep.perturbed_values())?;
        Ok(Phase::Perturbing)
    }

    fn perturbed(&mut self) -> Result<Phase, ControlError> {
        let residuals: Vec<f64> = self.residuals()?.into_iter().map(|(r, _)| r).collect();
        let more = self.sweep.record(&residuals);
        self.registry.set_variable_values(&self.sweep.perturbed_values())?;
        Ok(if more { Phase::Perturbing } else { Phase::Calculating })
    }

    fn calculate(&mut self) -> Result<Phase, ControlError> {
        let rows = self.sweep.base_f().len();
        let jacobian = self.sweep.jacobian_rows(0..rows);
        let rhs: Vec<f64> = self.sweep.base_f().iter().map(|r| -r).collect();
        let step = linalg::solve_jacobian(&jacobian, &rhs).ok_or_else(|| {
            ControlError::SingularSystem {
                solver: self.name.clone(),
                iteration: self.iterations,
            }
        })?;
        let next: Vec<f64> = self
            .registry
            .variable_specs()
            .zip(self.sweep.base_x())
            .zip(&step)
            .map(|((spec, x), dx)| spec.clamp(x + dx.clamp(-spec.max_step, spec.max_step)))
            .collect();
        debug!(solver = %self.name, ?step, ?next, "newton step");
        self.registry.set_variable_values(&next)?;
        self.iterations += 1;
        Ok(Phase::Nominal)
    }
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.12}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Solver for DifferentialCorrector {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "DifferentialCorrector"
    }

    fn engine_kind(&self) -> EngineKind {
        EngineKind::Internal
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn iterations(&self) -> usize {
        self.iterations
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
        self.iterations = 0;
        self.status = SolverStatus::Running;
        self.sweep = ForwardDifference::default();
        self.progress.clear();
        self.registry.reset_values();
    }

    #[instrument(skip_all, fields(solver = %self.name, phase = %self.phase))]
    fn advance(&mut self) -> Result<Phase, ControlError> {
        let next = match self.phase {
            Phase::Initializing => Phase::Nominal,
            Phase::Nominal => {
                self.record_nominal()?;
                Phase::CheckingRun
            }
            Phase::CheckingRun => self.check()?,
            Phase::Perturbing => self.perturbed()?,
            Phase::Calculating => self.calculate()?,
            Phase::Finished => Phase::Finished,
            phase @ (Phase::RunExternal | Phase::RunSpecial) => {
                return Err(ControlError::UnexpectedPhase {
                    solver: self.name.clone(),
                    phase,
                    engine: "internal",
                });
            }
        };
        debug!(from = %self.phase, to = %next, "advance");
        self.phase = next;
        Ok(next)
    }

    fn drain_progress(&mut self) -> Vec<String> {
        std::mem::take(&mut self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{Registration, ResultSpec};
    use crate::core::types::Handle;
    use approx::assert_relative_eq;

    fn corrector() -> (DifferentialCorrector, Handle, Handle) {
        let mut dc = DifferentialCorrector::new("DC1", 25);
        let mut spec = VariableSpec::new("v", 5.0);
        spec.lower = 0.0;
        spec.upper = 10.0;
        let v = dc
            .registry_mut()
            .register(Registration::Variable(spec), 0)
            .expect("variable");
        let c = dc
            .registry_mut()
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("goal");
        dc.initialize().expect("initialize");
        (dc, v, c)
    }

    /// Drive the solver the way a sequence would, evaluating `c = v - 3` for each pass.
    fn run(dc: &mut DifferentialCorrector, v: Handle, c: Handle) -> Vec<Phase> {
        let mut phases = vec![dc.phase()];
        while dc.phase() != Phase::Finished {
            if dc.phase().runs_pass() {
                let value = dc.registry().variable_value(v).expect("v");
                dc.registry_mut()
                    .report_value(c, value - 3.0, Role::EqualityConstraint)
                    .expect("report");
            }
            phases.push(dc.advance().expect("advance"));
        }
        phases
    }

    #[test]
    fn converges_linear_goal_in_one_iteration() {
        let (mut dc, v, c) = corrector();
        let phases = run(&mut dc, v, c);
        assert_eq!(dc.status(), SolverStatus::Converged);
        assert_eq!(dc.iterations(), 1);
        assert_relative_eq!(
            dc.registry().variable_value(v).expect("v"),
            3.0,
            epsilon = 1e-6
        );
        assert_eq!(
            phases,
            vec![
                Phase::Initializing,
                Phase::Nominal,
                Phase::CheckingRun,
                Phase::Perturbing,
                Phase::Calculating,
                Phase::Nominal,
                Phase::CheckingRun,
                Phase::Finished,
            ]
        );
        let report = dc.final_report();
        assert!(report.contains(&"   iterationsTaken = 1".to_string()));
        assert!(
            report
                .iter()
                .any(|line| line.trim_start().starts_with("v = 3"))
        );
    }

    #[test]
    fn missing_goal_report_is_a_protocol_error() {
        let (mut dc, _, _) = corrector();
        dc.advance().expect("to nominal");
        assert!(matches!(dc.advance(), Err(ControlError::Protocol { .. })));
    }

    #[test]
    fn external_phases_are_rejected() {
        let (mut dc, _, _) = corrector();
        dc.phase = Phase::RunExternal;
        assert!(matches!(
            dc.advance(),
            Err(ControlError::UnexpectedPhase { engine: "internal", .. })
        ));
    }

    #[test]
    fn iteration_limit_finishes_without_convergence() {
        let mut dc = DifferentialCorrector::new("DC1", 1);
        let v = dc
            .registry_mut()
            .register(Registration::Variable(VariableSpec::new("v", 5.0)), 0)
            .expect("variable");
        let c = dc
            .registry_mut()
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("goal");
        dc.initialize().expect("initialize");
        // c = v^2 + 1 has no root.
        while dc.phase() != Phase::Finished {
            if dc.phase().runs_pass() {
                let x = dc.registry().variable_value(v).expect("v");
                dc.registry_mut()
                    .report_value(c, x * x + 1.0, Role::EqualityConstraint)
                    .expect("report");
            }
            dc.advance().expect("advance");
        }
        assert_eq!(dc.status(), SolverStatus::ExceededIterations);
        assert_eq!(dc.iterations(), 1);
    }
}
