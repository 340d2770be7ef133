//! Commands a mission sequence and a branch are made of.
//!
//! The set is closed: [`Command`] is a sum type, and the two questions the
//! branch and the sequence ask of a command (does it register with a solver,
//! does it open or close a nesting level) are answered through the
//! [`RegistersWithSolver`] and [`IsBranchControl`] traits.

use std::fmt;

use tracing::trace;

use crate::context::ExecContext;
use crate::core::error::ControlError;
use crate::core::expr::Expr;
use crate::core::objects::ObjectStore;
use crate::core::registry::{Registration, ResultSpec, VariableSpec};
use crate::core::types::{Handle, Role, SequenceKind, StepStatus};
use crate::sequence::ControlSequence;
use crate::solver::Solver;

/// `Target = expr`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub target: String,
    pub expr: Expr,
}

/// Writes `name = value` for each listed object to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub names: Vec<String>,
}

/// Independent variable driven by a solver.
#[derive(Debug, Clone, PartialEq)]
pub struct Vary {
    pub solver: String,
    pub target: String,
    pub initial: Expr,
    pub perturbation: f64,
    pub lower: f64,
    pub upper: f64,
    pub max_step: f64,
    pub handle: Option<Handle>,
}

/// Equality goal of a targeter: `expr` should equal `goal`.
#[derive(Debug, Clone, PartialEq)]
pub struct Achieve {
    pub solver: String,
    pub expr: Expr,
    pub goal: Expr,
    pub tolerance: f64,
    pub handle: Option<Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    LessEqual,
    GreaterEqual,
    Equal,
}

impl Relation {
    pub fn symbol(self) -> &'static str {
        match self {
            Relation::LessEqual => "<=",
            Relation::GreaterEqual => ">=",
            Relation::Equal => "=",
        }
    }
}

/// Optimizer constraint `lhs <op> rhs`.
///
/// The reported value is `lhs - rhs` for `<=` and `=`, `rhs - lhs` for `>=`,
/// so that a feasible inequality always reports a value `<= 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct NonlinearConstraint {
    pub solver: String,
    pub lhs: Expr,
    pub op: Relation,
    pub rhs: Expr,
    pub tolerance: f64,
    pub handle: Option<Handle>,
}

impl NonlinearConstraint {
    fn value(&self, objects: &ObjectStore) -> Result<f64, ControlError> {
        let lhs = self.lhs.eval(objects)?;
        let rhs = self.rhs.eval(objects)?;
        Ok(match self.op {
            Relation::LessEqual | Relation::Equal => lhs - rhs,
            Relation::GreaterEqual => rhs - lhs,
        })
    }

    fn describe(&self) -> String {
        format!("{} {} {}", self.lhs, self.op.symbol(), self.rhs)
    }
}

/// Objective of an optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimize {
    pub solver: String,
    pub expr: Expr,
    pub handle: Option<Handle>,
}

#[derive(Debug)]
pub enum Command {
    Assign(Assign),
    Report(Report),
    Vary(Vary),
    Achieve(Achieve),
    NonlinearConstraint(NonlinearConstraint),
    Minimize(Minimize),
    /// Entry command of a (possibly nested) control sequence.
    Sequence(Box<ControlSequence>),
    /// Close marker of a control sequence.
    End(SequenceKind),
}

/// How a command changes the nesting structure of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchControl {
    Opens(SequenceKind),
    Closes(SequenceKind),
}

pub trait IsBranchControl {
    fn branch_control(&self) -> Option<BranchControl>;
}

/// Commands that publish a variable or a result to a solver.
pub trait RegistersWithSolver {
    /// Name of the solver the command addresses.
    fn solver_name(&self) -> &str;

    fn role(&self) -> Role;

    /// Registration record, evaluated against the current object values.
    fn registration(&self, objects: &ObjectStore) -> Result<Registration, ControlError>;

    fn set_handle(&mut self, handle: Handle);

    fn handle(&self) -> Option<Handle>;
}

impl RegistersWithSolver for Vary {
    fn solver_name(&self) -> &str {
        &self.solver
    }

    fn role(&self) -> Role {
        Role::Variable
    }

    fn registration(&self, objects: &ObjectStore) -> Result<Registration, ControlError> {
        Ok(Registration::Variable(VariableSpec {
            name: self.target.clone(),
            initial: self.initial.eval(objects)?,
            perturbation: self.perturbation,
            lower: self.lower,
            upper: self.upper,
            max_step: self.max_step,
        }))
    }

    fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
    }
}

impl RegistersWithSolver for Achieve {
    fn solver_name(&self) -> &str {
        &self.solver
    }

    fn role(&self) -> Role {
        Role::EqualityConstraint
    }

    fn registration(&self, objects: &ObjectStore) -> Result<Registration, ControlError> {
        Ok(Registration::Result(ResultSpec {
            name: self.expr.source().to_string(),
            role: Role::EqualityConstraint,
            goal: self.goal.eval(objects)?,
            tolerance: self.tolerance,
        }))
    }

    fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
    }
}

impl RegistersWithSolver for NonlinearConstraint {
    fn solver_name(&self) -> &str {
        &self.solver
    }

    fn role(&self) -> Role {
        match self.op {
            Relation::Equal => Role::EqualityConstraint,
            Relation::LessEqual | Relation::GreaterEqual => Role::InequalityConstraint,
        }
    }

    fn registration(&self, _objects: &ObjectStore) -> Result<Registration, ControlError> {
        Ok(Registration::Result(ResultSpec {
            name: self.describe(),
            role: self.role(),
            goal: 0.0,
            tolerance: self.tolerance,
        }))
    }

    fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
    }
}

impl RegistersWithSolver for Minimize {
    fn solver_name(&self) -> &str {
        &self.solver
    }

    fn role(&self) -> Role {
        Role::Objective
    }

    fn registration(&self, _objects: &ObjectStore) -> Result<Registration, ControlError> {
        Ok(Registration::Result(ResultSpec::new(
            self.expr.source(),
            Role::Objective,
        )))
    }

    fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    fn handle(&self) -> Option<Handle> {
        self.handle
    }
}

impl IsBranchControl for Command {
    fn branch_control(&self) -> Option<BranchControl> {
        match self {
            Command::Sequence(sequence) => Some(BranchControl::Opens(sequence.kind())),
            Command::End(kind) => Some(BranchControl::Closes(*kind)),
            _ => None,
        }
    }
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Assign(_) => "Assign",
            Command::Report(_) => "Report",
            Command::Vary(_) => "Vary",
            Command::Achieve(_) => "Achieve",
            Command::NonlinearConstraint(_) => "NonlinearConstraint",
            Command::Minimize(_) => "Minimize",
            Command::Sequence(sequence) => sequence.kind().open_keyword(),
            Command::End(kind) => kind.close_keyword(),
        }
    }

    pub fn as_registering(&self) -> Option<&dyn RegistersWithSolver> {
        match self {
            Command::Vary(cmd) => Some(cmd),
            Command::Achieve(cmd) => Some(cmd),
            Command::NonlinearConstraint(cmd) => Some(cmd),
            Command::Minimize(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn as_registering_mut(&mut self) -> Option<&mut dyn RegistersWithSolver> {
        match self {
            Command::Vary(cmd) => Some(cmd),
            Command::Achieve(cmd) => Some(cmd),
            Command::NonlinearConstraint(cmd) => Some(cmd),
            Command::Minimize(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn is_objective(&self) -> bool {
        self.as_registering()
            .is_some_and(|cmd| cmd.role() == Role::Objective)
    }

    /// Run one step of this command.
    ///
    /// Worker commands always complete in one step. A nested control sequence
    /// returns [`StepStatus::Running`] until its own run is complete.
    pub fn execute(
        &mut self,
        ctx: &mut ExecContext<'_>,
        solver: Option<&mut dyn Solver>,
    ) -> Result<StepStatus, ControlError> {
        trace!(command = self.keyword(), "execute");
        match self {
            Command::Assign(assign) => {
                let value = assign.expr.eval(ctx.objects)?;
                ctx.objects.set(&assign.target, value)?;
            }
            Command::Report(report) => {
                let mut parts = Vec::with_capacity(report.names.len());
                for name in &report.names {
                    parts.push(format!("{name} = {}", ctx.objects.get(name)?));
                }
                ctx.sink.report(&parts.join("   "));
            }
            Command::Vary(vary) => {
                let handle = vary
                    .handle
                    .ok_or(ControlError::Unregistered { command: "Vary" })?;
                let solver = owning_solver(solver, &vary.solver)?;
                let value = solver.registry().variable_value(handle)?;
                ctx.objects.set(&vary.target, value)?;
            }
            Command::Achieve(achieve) => {
                let handle = achieve
                    .handle
                    .ok_or(ControlError::Unregistered { command: "Achieve" })?;
                let value = achieve.expr.eval(ctx.objects)?;
                owning_solver(solver, &achieve.solver)?
                    .registry_mut()
                    .report_value(handle, value, Role::EqualityConstraint)?;
            }
            Command::NonlinearConstraint(constraint) => {
                let handle = constraint.handle.ok_or(ControlError::Unregistered {
                    command: "NonlinearConstraint",
                })?;
                let value = constraint.value(ctx.objects)?;
                let role = constraint.role();
                owning_solver(solver, &constraint.solver)?
                    .registry_mut()
                    .report_value(handle, value, role)?;
            }
            Command::Minimize(minimize) => {
                let handle = minimize.handle.ok_or(ControlError::Unregistered {
                    command: "Minimize",
                })?;
                let value = minimize.expr.eval(ctx.objects)?;
                owning_solver(solver, &minimize.solver)?
                    .registry_mut()
                    .report_value(handle, value, Role::Objective)?;
            }
            Command::Sequence(sequence) => return sequence.step(ctx),
            Command::End(_) => {}
        }
        Ok(StepStatus::Complete)
    }
}

fn owning_solver<'s>(
    solver: Option<&'s mut dyn Solver>,
    name: &str,
) -> Result<&'s mut dyn Solver, ControlError> {
    solver.ok_or_else(|| ControlError::MissingSolver {
        name: name.to_string(),
    })
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Assign(assign) => write!(f, "{} = {}", assign.target, assign.expr),
            Command::Report(report) => write!(f, "Report {}", report.names.join(" ")),
            Command::Vary(vary) => write!(
                f,
                "Vary {}({} = {})",
                vary.solver, vary.target, vary.initial
            ),
            Command::Achieve(achieve) => write!(
                f,
                "Achieve {}({} = {})",
                achieve.solver, achieve.expr, achieve.goal
            ),
            Command::NonlinearConstraint(constraint) => {
                let relation = constraint.describe();
                write!(f, "NonlinearConstraint {}({relation})", constraint.solver)
            }
            Command::Minimize(minimize) => {
                write!(f, "Minimize {}({})", minimize.solver, minimize.expr)
            }
            Command::Sequence(sequence) => {
                write!(f, "{} {}", sequence.kind(), sequence.solver_name())
            }
            Command::End(kind) => f.write_str(kind.close_keyword()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Interrupt, Transcript};
    use crate::core::objects::ObjectKind;

    fn objects() -> ObjectStore {
        let mut objects = ObjectStore::new();
        objects.declare("v", ObjectKind::Variable);
        objects.declare("c", ObjectKind::Variable);
        objects.set("v", 4.0).expect("set");
        objects
    }

    #[test]
    fn assign_and_report_use_the_object_store() {
        let mut objects = objects();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        let mut ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);

        let mut assign = Command::Assign(Assign {
            target: "c".into(),
            expr: Expr::parse("v - 3").expect("expr"),
        });
        assert_eq!(
            assign.execute(&mut ctx, None).expect("assign"),
            StepStatus::Complete
        );
        let mut report = Command::Report(Report {
            names: vec!["v".into(), "c".into()],
        });
        report.execute(&mut ctx, None).expect("report");
        assert_eq!(sink.lines, vec!["v = 4   c = 1".to_string()]);
    }

    #[test]
    fn constraint_values_are_signed_for_feasibility() {
        let objects = objects();
        let ge = NonlinearConstraint {
            solver: "Opt".into(),
            lhs: Expr::parse("v").expect("lhs"),
            op: Relation::GreaterEqual,
            rhs: Expr::constant(6.0),
            tolerance: 1e-8,
            handle: None,
        };
        assert_eq!(ge.value(&objects).expect("value"), 2.0);
        assert_eq!(ge.role(), Role::InequalityConstraint);
    }

    #[test]
    fn unregistered_worker_fails() {
        let mut objects = objects();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        let mut ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut minimize = Command::Minimize(Minimize {
            solver: "Opt".into(),
            expr: Expr::parse("v^2").expect("expr"),
            handle: None,
        });
        assert!(matches!(
            minimize.execute(&mut ctx, None),
            Err(ControlError::Unregistered {
                command: "Minimize",
            })
        ));
    }

    #[test]
    fn branch_control_is_reported_for_close_markers_only() {
        assert_eq!(
            Command::End(SequenceKind::Target).branch_control(),
            Some(BranchControl::Closes(SequenceKind::Target))
        );
        let report = Command::Report(Report { names: vec![] });
        assert_eq!(report.branch_control(), None);
        assert!(report.as_registering().is_none());
    }
}
