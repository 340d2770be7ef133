//! Branch controller: the cyclic body of a control sequence.
//!
//! Commands live in an arena; each slot's [`Link`] names its successor. The
//! close marker links back to [`Link::Entry`], so one walk from the first slot
//! to the entry link is one pass. Commands that belong to a nested control
//! sequence are forwarded into that sequence's own branch while it is open.

use tracing::{debug, trace};

use crate::command::{BranchControl, Command, IsBranchControl};
use crate::context::ExecContext;
use crate::core::error::ControlError;
use crate::core::types::{RegistrationCounts, SequenceKind, StepStatus};
use crate::solver::Solver;

/// Successor of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Node(usize),
    /// Back to the entry command: the pass is over.
    Entry,
    /// Not linked yet; only the last slot of an open branch.
    Unlinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Idle,
    At(usize),
}

#[derive(Debug)]
pub struct Branch {
    kind: SequenceKind,
    solver: String,
    level: usize,
    commands: Vec<Command>,
    links: Vec<Link>,
    depth: usize,
    open_nested: Option<usize>,
    objectives: usize,
    closed: bool,
    cursor: Cursor,
}

impl Branch {
    pub fn new(kind: SequenceKind, solver: &str, level: usize) -> Self {
        Self {
            kind,
            solver: solver.to_string(),
            level,
            commands: Vec::new(),
            links: Vec::new(),
            depth: 0,
            open_nested: None,
            objectives: 0,
            closed: false,
            cursor: Cursor::Idle,
        }
    }

    pub fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current nesting depth below this branch's own level.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn link(&self, index: usize) -> Option<Link> {
        self.links.get(index).copied()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> impl Iterator<Item = &mut Command> {
        self.commands.iter_mut()
    }

    /// Append a command at the build cursor.
    pub fn append(&mut self, mut command: Command) -> Result<(), ControlError> {
        if self.closed {
            return Err(ControlError::BranchClosed { kind: self.kind });
        }
        match command.branch_control() {
            Some(BranchControl::Closes(kind)) => {
                if self.depth > 0 {
                    self.forward(command)?;
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.open_nested = None;
                    }
                    return Ok(());
                }
                if kind != self.kind {
                    return Err(ControlError::MismatchedClose {
                        open: self.kind,
                        found: kind,
                    });
                }
                let index = self.push(command);
                self.links[index] = Link::Entry;
                self.closed = true;
                debug!(
                    kind = %self.kind,
                    solver = %self.solver,
                    commands = self.commands.len(),
                    "branch closed"
                );
            }
            Some(BranchControl::Opens(_)) => {
                if self.depth > 0 {
                    self.forward(command)?;
                } else {
                    if let Command::Sequence(nested) = &mut command {
                        nested.set_level(self.level + 1);
                    }
                    let index = self.push(command);
                    self.open_nested = Some(index);
                }
                self.depth += 1;
            }
            None => {
                let objective = command.is_objective();
                if objective && self.objectives + 1 > self.depth + 1 {
                    return Err(ControlError::ObjectiveLimit {
                        count: self.objectives + 1,
                        depth: self.depth,
                    });
                }
                if self.depth > 0 {
                    self.forward(command)?;
                } else {
                    self.validate(&command)?;
                    self.push(command);
                }
                if objective {
                    self.objectives += 1;
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, command: Command) -> usize {
        let index = self.commands.len();
        if let Some(last) = self.links.last_mut() {
            *last = Link::Node(index);
        }
        trace!(index, command = command.keyword(), "append");
        self.commands.push(command);
        self.links.push(Link::Unlinked);
        index
    }

    fn forward(&mut self, command: Command) -> Result<(), ControlError> {
        let target = self
            .open_nested
            .and_then(|index| self.commands.get_mut(index));
        match target {
            Some(Command::Sequence(nested)) => nested.append(command),
            _ => Err(ControlError::BranchNotClosed { kind: self.kind }),
        }
    }

    /// Checks applied to worker commands placed directly in this branch.
    fn validate(&self, command: &Command) -> Result<(), ControlError> {
        let allowed = match command {
            Command::Achieve(_) => self.kind == SequenceKind::Target,
            Command::Minimize(_) | Command::NonlinearConstraint(_) => {
                self.kind == SequenceKind::Optimize
            }
            _ => true,
        };
        if !allowed {
            return Err(ControlError::CommandNotAllowed {
                command: command.keyword(),
                kind: self.kind,
            });
        }
        if let Some(registering) = command.as_registering()
            && registering.solver_name() != self.solver
        {
            return Err(ControlError::SolverMismatch {
                command: command.keyword(),
                addressed: registering.solver_name().to_string(),
                owner: self.solver.clone(),
            });
        }
        Ok(())
    }

    /// Roles of the commands that register with this branch's solver.
    pub fn registration_counts(&self) -> RegistrationCounts {
        let mut counts = RegistrationCounts::default();
        for command in &self.commands {
            if let Some(registering) = command.as_registering() {
                counts.add(registering.role());
            }
        }
        counts
    }

    pub fn is_executing(&self) -> bool {
        self.cursor != Cursor::Idle
    }

    /// Forget any pass in progress; the next step starts at the first command.
    pub fn rewind(&mut self) {
        self.cursor = Cursor::Idle;
    }

    /// Abort nested sequences left mid-run by an aborted pass.
    pub fn abort_nested(&mut self) {
        for command in &mut self.commands {
            if let Command::Sequence(nested) = command {
                nested.abort();
            }
        }
    }

    /// Execute exactly one command and move the cursor.
    ///
    /// Returns [`StepStatus::Complete`] once the cursor is back at the entry.
    /// A nested sequence that is still running keeps the cursor where it is.
    pub fn execute_step(
        &mut self,
        ctx: &mut ExecContext<'_>,
        solver: &mut dyn Solver,
    ) -> Result<StepStatus, ControlError> {
        if !self.closed {
            return Err(ControlError::BranchNotClosed { kind: self.kind });
        }
        let index = match self.cursor {
            Cursor::Idle => 0,
            Cursor::At(index) => index,
        };
        let status = self.commands[index].execute(ctx, Some(solver))?;
        if status == StepStatus::Running {
            self.cursor = Cursor::At(index);
            return Ok(StepStatus::Running);
        }
        match self.links[index] {
            Link::Node(next) => {
                self.cursor = Cursor::At(next);
                Ok(StepStatus::Running)
            }
            Link::Entry => {
                self.cursor = Cursor::Idle;
                Ok(StepStatus::Complete)
            }
            Link::Unlinked => Err(ControlError::BranchNotClosed { kind: self.kind }),
        }
    }

    /// Walk the rest of the current pass in one go.
    pub fn run_to_completion(
        &mut self,
        ctx: &mut ExecContext<'_>,
        solver: &mut dyn Solver,
    ) -> Result<(), ControlError> {
        loop {
            if ctx.interrupt.is_set() {
                return Err(ControlError::Interrupted);
            }
            if self.execute_step(ctx, solver)? == StepStatus::Complete {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Achieve, Assign, Minimize, Report};
    use crate::context::{Interrupt, Transcript};
    use crate::core::expr::Expr;
    use crate::core::objects::{ObjectKind, ObjectStore};
    use crate::solver::{DifferentialCorrector, Optimizer};

    fn assign(target: &str, expr: &str) -> Command {
        Command::Assign(Assign {
            target: target.into(),
            expr: Expr::parse(expr).expect("expr"),
        })
    }

    fn minimize(solver: &str) -> Command {
        Command::Minimize(Minimize {
            solver: solver.into(),
            expr: Expr::parse("v^2").expect("expr"),
            handle: None,
        })
    }

    #[test]
    fn close_at_depth_zero_links_back_to_entry() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        branch.append(assign("v", "1")).expect("first");
        branch.append(assign("v", "v + 1")).expect("second");
        assert_eq!(branch.link(1), Some(Link::Unlinked));
        branch
            .append(Command::End(SequenceKind::Target))
            .expect("close");
        assert!(branch.is_closed());
        assert_eq!(branch.link(0), Some(Link::Node(1)));
        assert_eq!(branch.link(1), Some(Link::Node(2)));
        assert_eq!(branch.link(2), Some(Link::Entry));
        assert!(matches!(
            branch.append(assign("v", "0")),
            Err(ControlError::BranchClosed { .. })
        ));
    }

    #[test]
    fn wrong_close_marker_is_rejected() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        assert!(matches!(
            branch.append(Command::End(SequenceKind::Optimize)),
            Err(ControlError::MismatchedClose { .. })
        ));
    }

    #[test]
    fn one_objective_at_depth_zero() {
        let mut branch = Branch::new(SequenceKind::Optimize, "Opt", 0);
        branch.append(minimize("Opt")).expect("first objective");
        assert!(matches!(
            branch.append(minimize("Opt")),
            Err(ControlError::ObjectiveLimit { count: 2, depth: 0 })
        ));
    }

    #[test]
    fn nested_level_allows_one_more_objective() {
        let mut branch = Branch::new(SequenceKind::Optimize, "Outer", 0);
        branch.append(minimize("Outer")).expect("outer objective");
        let nested = crate::sequence::ControlSequence::new(
            SequenceKind::Optimize,
            Box::new(Optimizer::new("Inner", 10, 1e-8, 1e-8)),
        );
        branch
            .append(Command::Sequence(Box::new(nested)))
            .expect("open nested");
        assert_eq!(branch.depth(), 1);
        branch.append(minimize("Inner")).expect("nested objective");
        assert!(matches!(
            branch.append(minimize("Inner")),
            Err(ControlError::ObjectiveLimit { count: 3, depth: 1 })
        ));
        branch
            .append(Command::End(SequenceKind::Optimize))
            .expect("close nested");
        assert_eq!(branch.depth(), 0);
        assert!(!branch.is_closed());
        branch
            .append(Command::End(SequenceKind::Optimize))
            .expect("close outer");
        assert!(branch.is_closed());
        assert_eq!(branch.len(), 3);
        let Command::Sequence(nested) = &branch.commands()[1] else {
            panic!("expected nested sequence");
        };
        assert_eq!(nested.level(), 1);
    }

    #[test]
    fn worker_commands_are_validated_against_the_sequence() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        assert!(matches!(
            branch.append(minimize("DC1")),
            Err(ControlError::CommandNotAllowed { command: "Minimize", .. })
        ));
        let achieve = Command::Achieve(Achieve {
            solver: "DC2".into(),
            expr: Expr::parse("c").expect("expr"),
            goal: Expr::constant(0.0),
            tolerance: 1e-8,
            handle: None,
        });
        assert!(matches!(
            branch.append(achieve),
            Err(ControlError::SolverMismatch { .. })
        ));
    }

    #[test]
    fn execute_step_walks_one_command_at_a_time() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        branch.append(assign("v", "v + 1")).expect("assign");
        branch
            .append(Command::Report(Report {
                names: vec!["v".into()],
            }))
            .expect("report");
        branch
            .append(Command::End(SequenceKind::Target))
            .expect("close");

        let mut objects = ObjectStore::new();
        objects.declare("v", ObjectKind::Variable);
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        let mut ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut solver = DifferentialCorrector::new("DC1", 10);

        assert_eq!(
            branch.execute_step(&mut ctx, &mut solver).expect("1"),
            StepStatus::Running
        );
        assert!(branch.is_executing());
        assert_eq!(
            branch.execute_step(&mut ctx, &mut solver).expect("2"),
            StepStatus::Running
        );
        assert_eq!(
            branch.execute_step(&mut ctx, &mut solver).expect("3"),
            StepStatus::Complete
        );
        assert!(!branch.is_executing());

        branch
            .run_to_completion(&mut ctx, &mut solver)
            .expect("second pass");
        assert_eq!(sink.lines, vec!["v = 1".to_string(), "v = 2".to_string()]);
    }

    #[test]
    fn unclosed_branch_cannot_execute() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        branch.append(assign("v", "1")).expect("assign");
        let mut objects = ObjectStore::new();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        let mut ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut solver = DifferentialCorrector::new("DC1", 10);
        assert!(matches!(
            branch.execute_step(&mut ctx, &mut solver),
            Err(ControlError::BranchNotClosed { .. })
        ));
    }

    #[test]
    fn interrupt_stops_a_full_walk() {
        let mut branch = Branch::new(SequenceKind::Target, "DC1", 0);
        branch
            .append(Command::End(SequenceKind::Target))
            .expect("close");
        let mut objects = ObjectStore::new();
        let mut sink = Transcript::new();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let mut ctx = ExecContext::new(&mut objects, &mut sink, &interrupt);
        let mut solver = DifferentialCorrector::new("DC1", 10);
        assert!(matches!(
            branch.run_to_completion(&mut ctx, &mut solver),
            Err(ControlError::Interrupted)
        ));
    }
}
