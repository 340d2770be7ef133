//! Sequential quadratic programming optimizer.
//!
//! Gradients come from forward differences, the Hessian of the Lagrangian is
//! a damped BFGS approximation, and inequality constraints are handled with a
//! simple active set. Iteration stops when the bounded step falls below
//! `tolerance` at a feasible point.

use tracing::{debug, info, instrument};

use crate::core::error::ControlError;
use crate::core::phase::Phase;
use crate::core::registry::{Registry, VariableSpec};
use crate::core::types::{EngineKind, SolverStatus};
use crate::solver::Solver;
use crate::solver::finite_difference::ForwardDifference;
use crate::solver::linalg::{self, Matrix};

/// Linearization kept from the previous iteration for the BFGS update.
#[derive(Debug, Clone)]
struct Previous {
    x: Vec<f64>,
    gradient: Vec<f64>,
    jacobian: Matrix,
}

/// Result vector layout: objective (if any), equalities, inequalities.
#[derive(Debug, Clone, Copy)]
struct Layout {
    objective: usize,
    equalities: usize,
    inequalities: usize,
}

impl Layout {
    fn constraints(&self) -> usize {
        self.equalities + self.inequalities
    }
}

#[derive(Debug)]
pub struct Optimizer {
    name: String,
    max_iterations: usize,
    tolerance: f64,
    feasibility_tolerance: f64,
    registry: Registry,
    phase: Phase,
    iterations: usize,
    status: SolverStatus,
    sweep: ForwardDifference,
    hessian: Matrix,
    multipliers: Vec<f64>,
    previous: Option<Previous>,
    progress: Vec<String>,
}

impl Optimizer {
    pub fn new(
        name: &str,
        max_iterations: usize,
        tolerance: f64,
        feasibility_tolerance: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            max_iterations,
            tolerance,
            feasibility_tolerance,
            registry: Registry::new(),
            phase: Phase::Initializing,
            iterations: 0,
            status: SolverStatus::Running,
            sweep: ForwardDifference::default(),
            hessian: Vec::new(),
            multipliers: Vec::new(),
            previous: None,
            progress: Vec::new(),
        }
    }

    fn layout(&self) -> Layout {
        let counts = self.registry.counts();
        Layout {
            objective: counts.objectives.min(1),
            equalities: counts.equalities,
            inequalities: counts.inequalities,
        }
    }

    /// Objective (if registered), equality residuals, inequality values.
    fn results(&self) -> Result<Vec<f64>, ControlError> {
        let layout = self.layout();
        let mut values = Vec::new();
        if layout.objective > 0 {
            let objective = self.registry.objective().ok_or_else(|| {
                ControlError::protocol("objective was not reported during the pass")
            })?;
            values.push(objective);
        }
        let equalities = self.registry.equality_residuals();
        let inequalities = self.registry.inequality_values();
        values.extend(equalities.into_iter().map(|(r, _)| r));
        values.extend(inequalities.into_iter().map(|(v, _)| v));
        if values.iter().any(|v| v.is_nan()) {
            return Err(ControlError::protocol(
                "a constraint was not reported during the pass",
            ));
        }
        Ok(values)
    }

    /// Feasibility of the nominal constraint values kept by the sweep
    /// (equalities, then inequalities). The registry holds the last
    /// perturbed pass by the time the step is calculated.
    fn feasible(&self, values: &[f64], layout: Layout) -> bool {
        let tolerances = self
            .registry
            .equality_residuals()
            .into_iter()
            .chain(self.registry.inequality_values())
            .map(|(_, tol)| tol.max(self.feasibility_tolerance));
        values
            .iter()
            .zip(tolerances)
            .enumerate()
            .all(|(k, (value, tol))| {
                if k < layout.equalities {
                    value.abs() <= tol
                } else {
                    *value <= tol
                }
            })
    }

    fn record_nominal(&mut self) -> Result<(), ControlError> {
        let results = self.results()?;
        let x = self.registry.variable_values();
        let objective = if self.layout().objective > 0 {
            format!("{:.12}", results[0])
        } else {
            "n/a".to_string()
        };
        self.progress.push(format!(
            "{} iteration {}: variables [{}] objective {}",
            self.name,
            self.iterations,
            x.iter()
                .map(|v| format!("{v:.12}"))
                .collect::<Vec<_>>()
                .join(", "),
            objective
        ));
        let specs: Vec<VariableSpec> = self.registry.variable_specs().cloned().collect();
        self.sweep = ForwardDifference::begin(x, results, &specs);
        Ok(())
    }

    fn check(&mut self) -> Result<Phase, ControlError> {
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
        let results = self.results()?;
        let more = self.sweep.record(&results);
        self.registry
            .set_variable_values(&self.sweep.perturbed_values())?;
        Ok(if more { Phase::Perturbing } else { Phase::Calculating })
    }

    fn lagrangian_gradient(gradient: &[f64], jacobian: &Matrix, multipliers: &[f64]) -> Vec<f64> {
        let mut out = gradient.to_vec();
        for (row, lambda) in jacobian.iter().zip(multipliers) {
            for (g, a) in out.iter_mut().zip(row) {
                *g += lambda * a;
            }
        }
        out
    }

    /// Powell-damped BFGS update of the Lagrangian Hessian.
    fn update_hessian(&mut self, x: &[f64], gradient: &[f64], jacobian: &Matrix) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        let s: Vec<f64> = x.iter().zip(&previous.x).map(|(a, b)| a - b).collect();
        let now = Self::lagrangian_gradient(gradient, jacobian, &self.multipliers);
        let before =
            Self::lagrangian_gradient(&previous.gradient, &previous.jacobian, &self.multipliers);
        let y: Vec<f64> = now.iter().zip(&before).map(|(a, b)| a - b).collect();

        let hs = linalg::mat_vec(&self.hessian, &s);
        let shs = linalg::dot(&s, &hs);
        if shs <= f64::EPSILON {
            return;
        }
        let sy = linalg::dot(&s, &y);
        let r: Vec<f64> = if sy >= 0.2 * shs {
            y
        } else {
            let theta = 0.8 * shs / (shs - sy);
            y.iter()
                .zip(&hs)
                .map(|(yi, hsi)| theta * yi + (1.0 - theta) * hsi)
                .collect()
        };
        let sr = linalg::dot(&s, &r);
        if sr <= f64::EPSILON {
            return;
        }
        for i in 0..s.len() {
            for j in 0..s.len() {
                self.hessian[i][j] += r[i] * r[j] / sr - hs[i] * hs[j] / shs;
            }
        }
    }

    /// Solve the equality-constrained QP over the working set, dropping
    /// inequalities whose multipliers come out negative.
    fn solve_qp(
        &self,
        gradient: &[f64],
        jacobian: &Matrix,
        values: &[f64],
        layout: Layout,
    ) -> Result<(Vec<f64>, Vec<f64>), ControlError> {
        let n = gradient.len();
        let mut working: Vec<usize> = (0..layout.equalities).collect();
        working.extend(
            (layout.equalities..layout.constraints())
                .filter(|&k| values[k] >= -self.feasibility_tolerance),
        );

        loop {
            let m = working.len();
            let mut kkt = vec![vec![0.0; n + m]; n + m];
            let mut rhs = vec![0.0; n + m];
            for i in 0..n {
                kkt[i][..n].copy_from_slice(&self.hessian[i]);
                rhs[i] = -gradient[i];
            }
            for (row, &k) in working.iter().enumerate() {
                for j in 0..n {
                    kkt[n + row][j] = jacobian[k][j];
                    kkt[j][n + row] = jacobian[k][j];
                }
                rhs[n + row] = -values[k];
            }
            let solution = linalg::solve(&kkt, &rhs).ok_or_else(|| ControlError::SingularSystem {
                solver: self.name.clone(),
                iteration: self.iterations,
            })?;

            let dropped = working
                .iter()
                .enumerate()
                .filter(|&(_, &k)| k >= layout.equalities)
                .map(|(row, _)| (row, solution[n + row]))
                .filter(|(_, lambda)| *lambda < 0.0)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((row, _)) = dropped {
                working.remove(row);
                continue;
            }

            let mut multipliers = vec![0.0; layout.constraints()];
            for (row, &k) in working.iter().enumerate() {
                multipliers[k] = solution[n + row];
            }
            return Ok((solution[..n].to_vec(), multipliers));
        }
    }

    fn calculate(&mut self) -> Result<Phase, ControlError> {
        let layout = self.layout();
        let n = self.sweep.base_x().len();
        let x = self.sweep.base_x().to_vec();
        let base_f = self.sweep.base_f().to_vec();
        let gradient = if layout.objective > 0 {
            self.sweep.jacobian_rows(0..1).remove(0)
        } else {
            vec![0.0; n]
        };
        let offset = layout.objective;
        let jacobian = self
            .sweep
            .jacobian_rows(offset..offset + layout.constraints());
        let values = &base_f[offset..];

        if self.hessian.len() != n {
            self.hessian = linalg::identity(n);
        }
        self.update_hessian(&x, &gradient, &jacobian);

        let (step, multipliers) = self.solve_qp(&gradient, &jacobian, values, layout)?;
        self.multipliers = multipliers;

        let next: Vec<f64> = self
            .registry
            .variable_specs()
            .zip(&x)
            .zip(&step)
            .map(|((spec, x), dx)| spec.clamp(x + dx.clamp(-spec.max_step, spec.max_step)))
            .collect();
        let taken: Vec<f64> = next.iter().zip(&x).map(|(a, b)| a - b).collect();
        debug!(solver = %self.name, ?step, ?next, "sqp step");

        if linalg::norm_inf(&taken) <= self.tolerance && self.feasible(values, layout) {
            info!(solver = %self.name, iterations = self.iterations, "converged");
            self.status = SolverStatus::Converged;
            return Ok(Phase::Finished);
        }

        self.previous = Some(Previous {
            x,
            gradient,
            jacobian,
        });
        self.registry.set_variable_values(&next)?;
        self.iterations += 1;
        Ok(Phase::Nominal)
    }
}

impl Solver for Optimizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "Optimizer"
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
        self.hessian.clear();
        self.multipliers.clear();
        self.previous = None;
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
    use crate::core::types::{Handle, Role};
    use approx::assert_relative_eq;

    struct Problem {
        opt: Optimizer,
        v: Handle,
        f: Handle,
        c: Handle,
    }

    fn problem(constraint: Role) -> Problem {
        let mut opt = Optimizer::new("Opt", 25, 1e-8, 1e-8);
        let mut spec = VariableSpec::new("v", 5.0);
        spec.lower = 0.0;
        spec.upper = 10.0;
        let registry = opt.registry_mut();
        let v = registry
            .register(Registration::Variable(spec), 0)
            .expect("variable");
        let objective = ResultSpec::new("f", Role::Objective);
        let f = registry
            .register(Registration::Result(objective), 0)
            .expect("objective");
        let c = registry
            .register(Registration::Result(ResultSpec::new("c", constraint)), 0)
            .expect("constraint");
        opt.initialize().expect("initialize");
        Problem { opt, v, f, c }
    }

    fn drive(p: &mut Problem, constraint: impl Fn(f64) -> f64) {
        let role = p.opt.registry().result_specs().nth(1).expect("spec").role;
        while p.opt.phase() != Phase::Finished {
            if p.opt.phase().runs_pass() {
                let v = p.opt.registry().variable_value(p.v).expect("v");
                let registry = p.opt.registry_mut();
                registry
                    .report_value(p.f, v * v, Role::Objective)
                    .expect("f");
                registry.report_value(p.c, constraint(v), role).expect("c");
            }
            p.opt.advance().expect("advance");
        }
    }

    #[test]
    fn equality_constrained_minimum() {
        let mut p = problem(Role::EqualityConstraint);
        drive(&mut p, |v| v - 3.0);
        assert_eq!(p.opt.status(), SolverStatus::Converged);
        assert_relative_eq!(
            p.opt.registry().variable_value(p.v).expect("v"),
            3.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn converges_when_perturbation_exceeds_feasibility_tolerance() {
        let mut opt = Optimizer::new("Opt", 25, 1e-8, 1e-8);
        let mut spec = VariableSpec::new("v", 5.0);
        spec.perturbation = 1e-3;
        let registry = opt.registry_mut();
        let v = registry
            .register(Registration::Variable(spec), 0)
            .expect("variable");
        let objective = ResultSpec::new("f", Role::Objective);
        let f = registry
            .register(Registration::Result(objective), 0)
            .expect("objective");
        let c = registry
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("constraint");
        opt.initialize().expect("initialize");
        let mut p = Problem { opt, v, f, c };
        drive(&mut p, |v| v - 3.0);
        assert_eq!(p.opt.status(), SolverStatus::Converged);
        assert!(p.opt.iterations() < 25);
        assert_relative_eq!(
            p.opt.registry().variable_value(p.v).expect("v"),
            3.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn active_inequality_holds_the_bound() {
        // minimize v^2 subject to v >= 2, written as 2 - v <= 0.
        let mut p = problem(Role::InequalityConstraint);
        drive(&mut p, |v| 2.0 - v);
        assert_eq!(p.opt.status(), SolverStatus::Converged);
        assert_relative_eq!(
            p.opt.registry().variable_value(p.v).expect("v"),
            2.0,
            epsilon = 1e-5
        );
    }

    #[test]
    fn missing_objective_report_is_a_protocol_error() {
        let mut p = problem(Role::EqualityConstraint);
        p.opt.advance().expect("to nominal");
        assert!(matches!(p.opt.advance(), Err(ControlError::Protocol { .. })));
    }
}
