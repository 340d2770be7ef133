//! External engine bridge.
//!
//! An [`ExternalEngine`] owns the iteration loop of an external solver. The
//! control sequence hands it a [`Problem`] and a [`CallbackHandler`]; every
//! callback the engine makes runs one full pass of the branch with the
//! engine's candidate variable values and returns the evaluated results.
//! The bridge is built per run and borrowed from the owning sequence; there is
//! no process-wide registration.

pub mod secant;
pub mod verbs;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::context::{ExecContext, SequenceEvent};
use crate::core::branch::Branch;
use crate::core::error::ControlError;
use crate::core::objects::ObjectStore;
use crate::core::phase::Phase;
use crate::core::registry::Registry;
use crate::core::snapshot::LoopSnapshot;
use crate::core::types::Role;
use crate::solver::{ExternalSettings, Solver};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemVariable {
    pub name: String,
    pub initial: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemResult {
    pub name: String,
    pub role: Role,
}

/// What an external engine is asked to solve.
///
/// `results` are in the order callback results are returned: objective
/// first, then constraints in registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub solver: String,
    pub variables: Vec<ProblemVariable>,
    pub results: Vec<ProblemResult>,
}

impl Problem {
    pub fn from_registry(solver: &str, registry: &Registry) -> Self {
        let bound = |v: f64| v.is_finite().then_some(v);
        let variables = registry
            .variable_specs()
            .zip(registry.variable_values())
            .map(|(spec, value)| ProblemVariable {
                name: spec.name.clone(),
                initial: value,
                lower: bound(spec.lower),
                upper: bound(spec.upper),
            })
            .collect();
        let objectives = registry
            .result_specs()
            .filter(|spec| spec.role == Role::Objective);
        let constraints = registry
            .result_specs()
            .filter(|spec| spec.role != Role::Objective);
        let results = objectives
            .chain(constraints)
            .map(|spec| ProblemResult {
                name: spec.name.clone(),
                role: spec.role,
            })
            .collect();
        Self {
            solver: solver.to_string(),
            variables,
            results,
        }
    }
}

/// How an engine run ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineVerdict {
    pub converged: bool,
    /// Best variable values found, applied before the final pass.
    pub best: Option<Vec<f64>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Executing,
    Completed,
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackStatus::Executing => "Executing",
            CallbackStatus::Completed => "Completed",
        })
    }
}

/// What an engine may call back into while it runs.
pub trait CallbackHandler {
    /// Evaluate one candidate; returns the results text.
    fn execute_callback(&mut self, payload: &str) -> Result<String, ControlError>;

    fn status(&self) -> CallbackStatus;

    fn last_results(&self) -> Option<&str>;

    /// Current value of an object or parameter.
    fn query(&self, name: &str) -> Option<f64>;
}

pub trait ExternalEngine: fmt::Debug {
    fn name(&self) -> &str;

    /// Run the engine to completion, calling back for every evaluation.
    fn run(
        &mut self,
        problem: &Problem,
        handler: &mut dyn CallbackHandler,
    ) -> Result<EngineVerdict, ControlError>;
}

/// Creates the engine for an `ExternalOptimizer` when a sequence is built.
pub trait EngineFactory {
    fn create(
        &self,
        solver: &str,
        settings: &ExternalSettings,
    ) -> Result<Box<dyn ExternalEngine>, ControlError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&str, &ExternalSettings) -> Result<Box<dyn ExternalEngine>, ControlError>,
{
    fn create(
        &self,
        solver: &str,
        settings: &ExternalSettings,
    ) -> Result<Box<dyn ExternalEngine>, ControlError> {
        self(solver, settings)
    }
}

/// Parse whitespace- or line-delimited floats, exactly `expected` of them.
pub fn parse_payload(payload: &str, expected: usize) -> Result<Vec<f64>, ControlError> {
    let values = payload
        .split_whitespace()
        .map(|item| {
            item.parse::<f64>()
                .map_err(|_| ControlError::payload(format!("'{item}' is not a number")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(ControlError::payload(format!(
            "expected {expected} values, got {}",
            values.len()
        )));
    }
    Ok(values)
}

/// Parse a results text (`value;value;...`) as returned by a callback.
pub fn parse_results(text: &str) -> Result<Vec<f64>, ControlError> {
    text.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<f64>()
                .map_err(|_| ControlError::payload(format!("result '{item}' is not a number")))
        })
        .collect()
}

/// Per-request record of the callback handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackChannel {
    payload: String,
    results: Option<String>,
    executing: bool,
}

impl CallbackChannel {
    fn begin(&mut self, payload: &str) {
        self.payload = payload.to_string();
        self.executing = true;
    }

    fn finish(&mut self, results: String) {
        self.results = Some(results);
        self.executing = false;
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Callback handler backed by a control sequence's branch and solver.
pub struct CallbackBridge<'a> {
    solver: &'a mut dyn Solver,
    branch: &'a mut Branch,
    snapshot: &'a mut LoopSnapshot<ObjectStore>,
    ctx: ExecContext<'a>,
    channel: CallbackChannel,
}

impl<'a> CallbackBridge<'a> {
    pub fn new(
        solver: &'a mut dyn Solver,
        branch: &'a mut Branch,
        snapshot: &'a mut LoopSnapshot<ObjectStore>,
        ctx: ExecContext<'a>,
    ) -> Self {
        Self {
            solver,
            branch,
            snapshot,
            ctx,
            channel: CallbackChannel::default(),
        }
    }

    pub fn channel(&self) -> &CallbackChannel {
        &self.channel
    }

    fn evaluate(&mut self, values: &[f64]) -> Result<String, ControlError> {
        if self.solver.callback_phase() == Some(Phase::Initializing) {
            self.snapshot.store(self.ctx.objects);
            self.solver.advance_callback(Some(values))?;
        }
        match self.solver.callback_phase() {
            Some(Phase::Nominal) => {}
            Some(phase) => {
                return Err(ControlError::protocol(format!(
                    "callback while solver '{}' is in callback phase {phase}",
                    self.solver.name()
                )));
            }
            None => {
                return Err(ControlError::protocol(format!(
                    "solver '{}' does not accept callbacks",
                    self.solver.name()
                )));
            }
        }
        self.solver.advance_callback(Some(values))?;
        self.snapshot.reset(self.ctx.objects)?;
        self.branch.rewind();
        self.branch
            .run_to_completion(&mut self.ctx, &mut *self.solver)?;
        self.solver.advance_callback(None)?;
        Ok(self.solver.registry().results_text())
    }
}

impl CallbackHandler for CallbackBridge<'_> {
    #[instrument(skip_all, fields(solver = %self.solver.name()))]
    fn execute_callback(&mut self, payload: &str) -> Result<String, ControlError> {
        if self.ctx.interrupt.is_set() {
            return Err(ControlError::Interrupted);
        }
        let expected = self.solver.registry().counts().variables;
        let values = parse_payload(payload, expected)?;
        self.channel.begin(payload);
        let results = self.evaluate(&values)?;
        debug!(%results, "callback evaluated");
        self.channel.finish(results.clone());
        let callbacks = self.solver.iterations();
        self.ctx.emit(SequenceEvent::CallbackServed {
            solver: self.solver.name().to_string(),
            callbacks,
        });
        Ok(results)
    }

    fn status(&self) -> CallbackStatus {
        if self.channel.executing {
            CallbackStatus::Executing
        } else {
            CallbackStatus::Completed
        }
    }

    fn last_results(&self) -> Option<&str> {
        self.channel.results.as_deref()
    }

    fn query(&self, name: &str) -> Option<f64> {
        self.ctx.objects.get(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_count_must_match() {
        assert_eq!(
            parse_payload("1 2.5\n-3", 3).expect("parse"),
            vec![1.0, 2.5, -3.0]
        );
        assert!(matches!(parse_payload("1 2", 3), Err(ControlError::Payload { .. })));
        assert!(matches!(parse_payload("1 x", 2), Err(ControlError::Payload { .. })));
    }

    #[test]
    fn results_text_splits_on_semicolons() {
        assert_eq!(parse_results("4;-0.5;").expect("parse"), vec![4.0, -0.5]);
        assert!(parse_results("4;abc;").is_err());
    }

    fn bridge_parts() -> (crate::solver::ExternalSolver, Branch, ObjectStore) {
        use crate::core::registry::{Registration, VariableSpec};
        use crate::core::types::SequenceKind;

        let mut solver = crate::solver::ExternalSolver::new("Ext", ExternalSettings::default());
        solver
            .registry_mut()
            .register(Registration::Variable(VariableSpec::new("v", 5.0)), 0)
            .expect("variable");
        solver.initialize().expect("initialize");
        solver.advance().expect("run external");
        let mut objects = ObjectStore::new();
        objects.declare("v", crate::core::objects::ObjectKind::Variable);
        let branch = Branch::new(SequenceKind::Optimize, "Ext", 0);
        (solver, branch, objects)
    }

    #[test]
    fn callback_while_calculating_is_a_protocol_error() {
        use crate::context::{Interrupt, Transcript};

        let (mut solver, mut branch, mut objects) = bridge_parts();
        solver.advance_callback(Some(&[1.0])).expect("init");
        solver.advance_callback(Some(&[1.0])).expect("assign");
        let mut snapshot = LoopSnapshot::new();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        let ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut bridge = CallbackBridge::new(&mut solver, &mut branch, &mut snapshot, ctx);
        assert!(matches!(
            bridge.execute_callback("2"),
            Err(ControlError::Protocol { .. })
        ));
        assert_eq!(bridge.last_results(), None);
    }

    #[test]
    fn interrupt_is_checked_before_each_callback() {
        use crate::context::{Interrupt, Transcript};

        let (mut solver, mut branch, mut objects) = bridge_parts();
        let mut snapshot = LoopSnapshot::new();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut bridge = CallbackBridge::new(&mut solver, &mut branch, &mut snapshot, ctx);
        assert!(matches!(bridge.execute_callback("2"), Err(ControlError::Interrupted)));
        assert_eq!(bridge.status(), CallbackStatus::Completed);
        assert_eq!(bridge.query("v"), Some(0.0));
    }

    #[test]
    fn problem_lists_objective_first_and_drops_infinite_bounds() {
        use crate::core::registry::{Registration, ResultSpec, VariableSpec};
        let mut registry = Registry::new();
        let mut spec = VariableSpec::new("v", 5.0);
        spec.lower = 0.0;
        registry
            .register(Registration::Variable(spec), 0)
            .expect("variable");
        registry
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("constraint");
        registry
            .register(Registration::Result(ResultSpec::new("f", Role::Objective)), 0)
            .expect("objective");
        let problem = Problem::from_registry("Ext", &registry);
        assert_eq!(problem.variables[0].lower, Some(0.0));
        assert_eq!(problem.variables[0].upper, None);
        let names: Vec<&str> = problem.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["f", "c"]);
        let json = serde_json::to_string(&problem).expect("json");
        assert!(!json.contains("upper"));
    }
}
