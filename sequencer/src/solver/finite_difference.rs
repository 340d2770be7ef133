//! Forward-difference derivatives, one perturbed pass per variable.

use crate::core::registry::VariableSpec;
use crate::solver::linalg::Matrix;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardDifference {
    base_x: Vec<f64>,
    base_f: Vec<f64>,
    steps: Vec<f64>,
    columns: Vec<Vec<f64>>,
}

impl ForwardDifference {
    /// Start a sweep around the nominal point `base_x` with results `base_f`.
    ///
    /// A variable whose forward step would cross its upper bound is perturbed
    /// backwards instead.
    pub fn begin(base_x: Vec<f64>, base_f: Vec<f64>, specs: &[VariableSpec]) -> Self {
        let steps = specs
            .iter()
            .zip(&base_x)
            .map(|(spec, x)| {
                let h = spec.perturbation.abs();
                if x + h > spec.upper { -h } else { h }
            })
            .collect();
        Self {
            base_x,
            base_f,
            steps,
            columns: Vec::new(),
        }
    }

    /// Index of the variable the next pass perturbs, if any remain.
    pub fn current(&self) -> Option<usize> {
        let index = self.columns.len();
        (index < self.steps.len()).then_some(index)
    }

    /// Variable values for the next perturbed pass.
    pub fn perturbed_values(&self) -> Vec<f64> {
        let mut values = self.base_x.clone();
        if let Some(index) = self.current() {
            values[index] += self.steps[index];
        }
        values
    }

    /// Record the results of the pass for the current variable. Returns true
    /// while more variables remain to be perturbed.
    pub fn record(&mut self, results: &[f64]) -> bool {
        if let Some(index) = self.current() {
            let h = self.steps[index];
            let column = results
                .iter()
                .zip(&self.base_f)
                .map(|(f, f0)| (f - f0) / h)
                .collect();
            self.columns.push(column);
        }
        self.current().is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.current().is_none()
    }

    pub fn base_x(&self) -> &[f64] {
        &self.base_x
    }

    pub fn base_f(&self) -> &[f64] {
        &self.base_f
    }

    /// `rows x cols` Jacobian with rows for results and columns for variables.
    /// Rows in `range` only, so callers can split objective and constraints.
    pub fn jacobian_rows(&self, range: std::ops::Range<usize>) -> Matrix {
        range
            .map(|row| self.columns.iter().map(|column| column[row]).collect())
            .collect()
    }
}
