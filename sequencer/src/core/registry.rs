//! Registration protocol between worker commands and a solver.
//!
//! Every solver owns one [`Registry`]. Worker commands register once, while
//! their sequence initializes, and receive a [`Handle`] they use for all later
//! value reporting. Variables and results live in separate handle spaces.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::ControlError;
use crate::core::types::{Handle, RegistrationCounts, Role};

/// Everything a solver needs to know about one independent variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub initial: f64,
    pub perturbation: f64,
    pub lower: f64,
    pub upper: f64,
    pub max_step: f64,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            initial,
            perturbation: 1e-6,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            max_step: f64::INFINITY,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }
}

/// An objective or constraint registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSpec {
    pub name: String,
    pub role: Role,
    /// Desired value for equality constraints; zero otherwise.
    pub goal: f64,
    pub tolerance: f64,
}

impl ResultSpec {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            goal: 0.0,
            tolerance: 1e-8,
        }
    }
}

/// What a command hands the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Variable(VariableSpec),
    Result(ResultSpec),
}

impl Registration {
    pub fn role(&self) -> Role {
        match self {
            Registration::Variable(_) => Role::Variable,
            Registration::Result(spec) => spec.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct VariableEntry {
    spec: VariableSpec,
    value: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct ResultEntry {
    spec: ResultSpec,
    level: usize,
    value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    variables: Vec<VariableEntry>,
    results: Vec<ResultEntry>,
    expected: Option<RegistrationCounts>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the build-time tally so `check_counts` can verify it later.
    pub fn set_counts(&mut self, counts: RegistrationCounts) {
        self.expected = Some(counts);
    }

    pub fn expected_counts(&self) -> Option<RegistrationCounts> {
        self.expected
    }

    pub fn counts(&self) -> RegistrationCounts {
        let mut counts = RegistrationCounts {
            variables: self.variables.len(),
            ..RegistrationCounts::default()
        };
        for entry in &self.results {
            counts.add(entry.spec.role);
        }
        counts
    }

    /// Fails if registrations differ from the tally pushed by `set_counts`.
    pub fn check_counts(&self, solver: &str) -> Result<(), ControlError> {
        let Some(want) = self.expected else {
            return Ok(());
        };
        let have = self.counts();
        let pairs = [
            ("variable", want.variables, have.variables),
            ("objective", want.objectives, have.objectives),
            ("equality constraint", want.equalities, have.equalities),
            ("inequality constraint", want.inequalities, have.inequalities),
        ];
        for (role, expected, actual) in pairs {
            if expected != actual {
                return Err(ControlError::CountMismatch {
                    solver: solver.to_string(),
                    role,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Register a variable or result and return its handle.
    ///
    /// Objectives are idempotent per name. A differently named objective at
    /// the same or a shallower nesting level than an existing one fails.
    pub fn register(
        &mut self,
        registration: Registration,
        level: usize,
    ) -> Result<Handle, ControlError> {
        match registration {
            Registration::Variable(spec) => {
                if self.variables.iter().any(|v| v.spec.name == spec.name) {
                    return Err(ControlError::DuplicateVariable { name: spec.name });
                }
                let handle = Handle(self.variables.len());
                debug!(name = %spec.name, %handle, "registered variable");
                self.variables.push(VariableEntry {
                    value: spec.clamp(spec.initial),
                    spec,
                });
                Ok(handle)
            }
            Registration::Result(spec) => {
                if spec.role == Role::Variable {
                    return Err(ControlError::UnknownResultKind {
                        kind: spec.role.to_string(),
                    });
                }
                if spec.role == Role::Objective {
                    for (index, entry) in self.results.iter().enumerate() {
                        if entry.spec.role != Role::Objective {
                            continue;
                        }
                        if entry.spec.name == spec.name {
                            return Ok(Handle(index));
                        }
                        if level <= entry.level {
                            return Err(ControlError::DuplicateObjective {
                                name: spec.name,
                                existing: entry.spec.name.clone(),
                                level,
                            });
                        }
                    }
                }
                let handle = Handle(self.results.len());
                debug!(name = %spec.name, role = %spec.role, %handle, level, "registered result");
                self.results.push(ResultEntry {
                    spec,
                    level,
                    value: None,
                });
                Ok(handle)
            }
        }
    }

    /// Update the current value behind `handle`. Nothing changes on error.
    pub fn report_value(
        &mut self,
        handle: Handle,
        value: f64,
        role: Role,
    ) -> Result<(), ControlError> {
        if role == Role::Variable {
            let len = self.variables.len();
            let entry = self
                .variables
                .get_mut(handle.0)
                .ok_or(ControlError::HandleOutOfRange { handle, role, len })?;
            entry.value = entry.spec.clamp(value);
            return Ok(());
        }
        let len = self.results.len();
        let entry = self
            .results
            .get_mut(handle.0)
            .ok_or(ControlError::HandleOutOfRange { handle, role, len })?;
        if entry.spec.role != role {
            return Err(ControlError::RoleMismatch {
                handle,
                registered: entry.spec.role,
                reported: role,
            });
        }
        entry.value = Some(value);
        Ok(())
    }

    /// String-keyed variant of [`Registry::report_value`].
    pub fn report_value_by_kind(
        &mut self,
        handle: Handle,
        value: f64,
        kind: &str,
    ) -> Result<(), ControlError> {
        let role = kind.parse::<Role>()?;
        self.report_value(handle, value, role)
    }

    pub fn variable_value(&self, handle: Handle) -> Result<f64, ControlError> {
        self.variables
            .get(handle.0)
            .map(|entry| entry.value)
            .ok_or(ControlError::HandleOutOfRange {
                handle,
                role: Role::Variable,
                len: self.variables.len(),
            })
    }

    pub fn variable_specs(&self) -> impl Iterator<Item = &VariableSpec> {
        self.variables.iter().map(|entry| &entry.spec)
    }

    pub fn variable_values(&self) -> Vec<f64> {
        self.variables.iter().map(|entry| entry.value).collect()
    }

    /// Set every variable at once, clamping each to its bounds.
    pub fn set_variable_values(&mut self, values: &[f64]) -> Result<(), ControlError> {
        if values.len() != self.variables.len() {
            return Err(ControlError::payload(format!(
                "expected {} variable values, got {}",
                self.variables.len(),
                values.len()
            )));
        }
        for (entry, value) in self.variables.iter_mut().zip(values) {
            entry.value = entry.spec.clamp(*value);
        }
        Ok(())
    }

    pub fn result_specs(&self) -> impl Iterator<Item = &ResultSpec> {
        self.results.iter().map(|entry| &entry.spec)
    }

    pub fn result_value(&self, handle: Handle) -> Option<f64> {
        self.results.get(handle.0).and_then(|entry| entry.value)
    }

    /// Current objective value, if an objective is registered and reported.
    pub fn objective(&self) -> Option<f64> {
        self.results
            .iter()
            .find(|entry| entry.spec.role == Role::Objective)
            .and_then(|entry| entry.value)
    }

    /// `(residual, tolerance)` for every equality constraint, residual being
    /// `value - goal`. Unreported constraints count as NaN.
    pub fn equality_residuals(&self) -> Vec<(f64, f64)> {
        self.results
            .iter()
            .filter(|entry| entry.spec.role == Role::EqualityConstraint)
            .map(|entry| {
                (
                    entry.value.map_or(f64::NAN, |v| v - entry.spec.goal),
                    entry.spec.tolerance,
                )
            })
            .collect()
    }

    /// `(value, tolerance)` for every inequality constraint (`value <= 0` is feasible).
    pub fn inequality_values(&self) -> Vec<(f64, f64)> {
        self.results
            .iter()
            .filter(|entry| entry.spec.role == Role::InequalityConstraint)
            .map(|entry| (entry.value.unwrap_or(f64::NAN), entry.spec.tolerance))
            .collect()
    }

    /// Objective first, then constraints in registration order, each followed by `;`.
    pub fn results_text(&self) -> String {
        let objectives = self
            .results
            .iter()
            .filter(|entry| entry.spec.role == Role::Objective);
        let constraints = self
            .results
            .iter()
            .filter(|entry| entry.spec.role != Role::Objective);
        objectives
            .chain(constraints)
            .map(|entry| format!("{};", entry.value.unwrap_or(f64::NAN)))
            .collect()
    }

    /// Return variables to their initial values and forget reported results.
    pub fn reset_values(&mut self) {
        for entry in &mut self.variables {
            entry.value = entry.spec.clamp(entry.spec.initial);
        }
        for entry in &mut self.results {
            entry.value = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objective(name: &str) -> Registration {
        Registration::Result(ResultSpec::new(name, Role::Objective))
    }

    #[test]
    fn handles_are_stable_and_separate_per_space() {
        let mut registry = Registry::new();
        let v = registry
            .register(Registration::Variable(VariableSpec::new("v", 5.0)), 0)
            .expect("variable");
        let c = registry
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("constraint");
        assert_eq!(v, Handle(0));
        assert_eq!(c, Handle(0));
        assert_eq!(registry.variable_value(v).expect("value"), 5.0);
    }

    #[test]
    fn objective_registration_is_idempotent_per_name() {
        let mut registry = Registry::new();
        let first = registry.register(objective("f"), 0).expect("first");
        let again = registry.register(objective("f"), 0).expect("again");
        assert_eq!(first, again);
        assert_eq!(registry.counts().objectives, 1);
    }

    #[test]
    fn second_objective_at_same_or_shallower_level_fails() {
        let mut registry = Registry::new();
        registry.register(objective("f"), 1).expect("first");
        assert!(matches!(
            registry.register(objective("g"), 1),
            Err(ControlError::DuplicateObjective { .. })
        ));
        assert!(matches!(
            registry.register(objective("g"), 0),
            Err(ControlError::DuplicateObjective { .. })
        ));
        registry
            .register(objective("h"), 2)
            .expect("deeper objective");
    }

    #[test]
    fn report_value_rejects_bad_handles_without_partial_update() {
        let mut registry = Registry::new();
        let c = registry
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("constraint");
        assert!(matches!(
            registry.report_value(Handle(3), 1.0, Role::EqualityConstraint),
            Err(ControlError::HandleOutOfRange { len: 1, .. })
        ));
        assert!(matches!(
            registry.report_value(c, 1.0, Role::Objective),
            Err(ControlError::RoleMismatch { .. })
        ));
        assert_eq!(registry.result_value(c), None);
        assert!(matches!(
            registry.report_value_by_kind(c, 1.0, "Target"),
            Err(ControlError::UnknownResultKind { .. })
        ));
        registry
            .report_value_by_kind(c, 2.0, "Equality")
            .expect("report");
        assert_eq!(registry.result_value(c), Some(2.0));
    }

    #[test]
    fn variables_are_clamped_to_bounds() {
        let mut registry = Registry::new();
        let mut spec = VariableSpec::new("v", 5.0);
        spec.lower = 0.0;
        spec.upper = 10.0;
        let v = registry
            .register(Registration::Variable(spec), 0)
            .expect("variable");
        registry.set_variable_values(&[12.0]).expect("set");
        assert_eq!(registry.variable_value(v).expect("value"), 10.0);
        assert!(registry.set_variable_values(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn count_check_compares_against_pushed_tally() {
        let mut registry = Registry::new();
        registry.set_counts(RegistrationCounts {
            variables: 1,
            equalities: 1,
            ..RegistrationCounts::default()
        });
        registry
            .register(Registration::Variable(VariableSpec::new("v", 0.0)), 0)
            .expect("variable");
        assert!(matches!(
            registry.check_counts("DC1"),
            Err(ControlError::CountMismatch { role: "equality constraint", .. })
        ));
    }

    #[test]
    fn results_text_puts_objective_first() {
        let mut registry = Registry::new();
        let c = registry
            .register(
                Registration::Result(ResultSpec::new("c", Role::EqualityConstraint)),
                0,
            )
            .expect("constraint");
        let f = registry.register(objective("f"), 0).expect("objective");
        registry
            .report_value(c, 2.0, Role::EqualityConstraint)
            .expect("report c");
        registry
            .report_value(f, 25.0, Role::Objective)
            .expect("report f");
        assert_eq!(registry.results_text(), "25;2;");
    }
}
