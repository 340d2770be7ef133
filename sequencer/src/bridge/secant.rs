//! Reference external engine.
//!
//! Moves the first variable only. With an equality constraint it runs a
//! secant iteration on the first one; otherwise it runs a golden section
//! search on the objective. Any other results are ignored. The same search
//! backs the in-process [`SecantEngine`] and the `secant-engine` binary.

use tracing::{debug, instrument};

use crate::bridge::{CallbackHandler, EngineVerdict, ExternalEngine, Problem, parse_results};
use crate::core::error::ControlError;
use crate::core::types::Role;

/// The golden ratio: φ = (1 + √5) / 2
const PHI: f64 = 1.618_033_988_749_895;

/// 1/φ, which equals φ - 1.
const INV_PHI: f64 = PHI - 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchSettings {
    /// Residual tolerance for roots, bracket width for minima.
    pub tolerance: f64,
    pub max_evaluations: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_evaluations: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub converged: bool,
    /// Last candidate evaluated.
    pub best: Vec<f64>,
    pub evaluations: usize,
    pub message: String,
}

/// Candidate values as a callback payload.
pub fn format_candidate(values: &[f64]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

struct Evaluator<F> {
    point: Vec<f64>,
    lower: f64,
    upper: f64,
    index: usize,
    evaluations: usize,
    evaluate: F,
}

impl<F, E> Evaluator<F>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, E>,
{
    fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.lower, self.upper)
    }

    /// Evaluate with the first variable at `x`. `None` if the result is missing.
    fn at(&mut self, x: f64) -> Result<Option<f64>, E> {
        self.point[0] = x;
        self.evaluations += 1;
        let results = (self.evaluate)(&self.point)?;
        Ok(results.get(self.index).copied())
    }

    fn outcome(&self, converged: bool, message: impl Into<String>) -> SearchOutcome {
        SearchOutcome {
            converged,
            best: self.point.clone(),
            evaluations: self.evaluations,
            message: message.into(),
        }
    }
}

#[instrument(skip_all, fields(solver = %problem.solver))]
pub fn search<F, E>(
    problem: &Problem,
    settings: &SearchSettings,
    evaluate: F,
) -> Result<SearchOutcome, E>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, E>,
{
    let point: Vec<f64> = problem.variables.iter().map(|v| v.initial).collect();
    let Some(first) = problem.variables.first() else {
        return Ok(SearchOutcome {
            converged: false,
            best: point,
            evaluations: 0,
            message: "no variables to vary".to_string(),
        });
    };
    let root = problem
        .results
        .iter()
        .position(|result| result.role == Role::EqualityConstraint);
    let objective = problem
        .results
        .iter()
        .position(|result| result.role == Role::Objective);
    let mut evaluator = Evaluator {
        lower: first.lower.unwrap_or(f64::NEG_INFINITY),
        upper: first.upper.unwrap_or(f64::INFINITY),
        point,
        index: 0,
        evaluations: 0,
        evaluate,
    };
    match (root, objective) {
        (Some(index), _) => {
            evaluator.index = index;
            secant(&mut evaluator, settings)
        }
        (None, Some(index)) => {
            evaluator.index = index;
            golden_section(&mut evaluator, settings)
        }
        (None, None) => Ok(evaluator.outcome(false, "no objective or equality constraint")),
    }
}

fn secant<F, E>(ev: &mut Evaluator<F>, settings: &SearchSettings) -> Result<SearchOutcome, E>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, E>,
{
    let mut x0 = ev.clamp(ev.point[0]);
    let Some(mut g0) = ev.at(x0)? else {
        return Ok(ev.outcome(false, "constraint value missing from results"));
    };
    if g0.abs() <= settings.tolerance {
        let message = format!("root found after {} evaluations", ev.evaluations);
        return Ok(ev.outcome(true, message));
    }
    let step = (1e-3 * x0.abs()).max(1e-3);
    let mut x1 = ev.clamp(x0 + step);
    if x1 == x0 {
        x1 = ev.clamp(x0 - step);
    }
    while ev.evaluations < settings.max_evaluations {
        let Some(g1) = ev.at(x1)? else {
            return Ok(ev.outcome(false, "constraint value missing from results"));
        };
        debug!(x = x1, residual = g1, "secant step");
        if g1.abs() <= settings.tolerance {
            let message = format!("root found after {} evaluations", ev.evaluations);
            return Ok(ev.outcome(true, message));
        }
        if g1 == g0 {
            return Ok(ev.outcome(false, "secant slope vanished"));
        }
        let x2 = ev.clamp(x1 - g1 * (x1 - x0) / (g1 - g0));
        (x0, g0, x1) = (x1, g1, x2);
    }
    Ok(ev.outcome(false, "evaluation limit reached"))
}

fn golden_section<F, E>(
    ev: &mut Evaluator<F>,
    settings: &SearchSettings,
) -> Result<SearchOutcome, E>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, E>,
{
    let x0 = ev.point[0];
    let span = x0.abs().max(1.0);
    let mut left = if ev.lower.is_finite() { ev.lower } else { x0 - span };
    let mut right = if ev.upper.is_finite() { ev.upper } else { x0 + span };
    let mut inner_left = left + (1.0 - INV_PHI) * (right - left);
    let mut inner_right = left + INV_PHI * (right - left);
    let (Some(mut f_left), Some(mut f_right)) = (ev.at(inner_left)?, ev.at(inner_right)?) else {
        return Ok(ev.outcome(false, "objective value missing from results"));
    };
    while right - left > settings.tolerance {
        if ev.evaluations + 1 >= settings.max_evaluations {
            ev.at((left + right) / 2.0)?;
            return Ok(ev.outcome(false, "evaluation limit reached"));
        }
        if f_left < f_right {
            right = inner_right;
            inner_right = inner_left;
            f_right = f_left;
            inner_left = left + (1.0 - INV_PHI) * (right - left);
            let Some(value) = ev.at(inner_left)? else {
                return Ok(ev.outcome(false, "objective value missing from results"));
            };
            f_left = value;
        } else {
            left = inner_left;
            inner_left = inner_right;
            f_left = f_right;
            inner_right = left + INV_PHI * (right - left);
            let Some(value) = ev.at(inner_right)? else {
                return Ok(ev.outcome(false, "objective value missing from results"));
            };
            f_right = value;
        }
    }
    ev.at((left + right) / 2.0)?;
    let message = format!("minimum bracketed after {} evaluations", ev.evaluations);
    Ok(ev.outcome(true, message))
}

/// In-process engine running [`search`] against the callback handler.
#[derive(Debug, Clone, Default)]
pub struct SecantEngine {
    settings: SearchSettings,
}

impl SecantEngine {
    pub fn new(settings: SearchSettings) -> Self {
        Self { settings }
    }
}

impl ExternalEngine for SecantEngine {
    fn name(&self) -> &str {
        "secant"
    }

    fn run(
        &mut self,
        problem: &Problem,
        handler: &mut dyn CallbackHandler,
    ) -> Result<EngineVerdict, ControlError> {
        let outcome = search(problem, &self.settings, |candidate| {
            let text = handler.execute_callback(&format_candidate(candidate))?;
            parse_results(&text)
        })?;
        debug!(
            evaluations = outcome.evaluations,
            converged = outcome.converged,
            "search finished"
        );
        Ok(EngineVerdict {
            converged: outcome.converged,
            best: Some(outcome.best),
            message: Some(outcome.message),
        })
    }
}
