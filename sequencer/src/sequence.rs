//! Control-sequence state machine.
//!
//! A [`ControlSequence`] is the `Target`/`Optimize` entry command. It owns its
//! solver, its branch, its loop snapshot and (for external solvers) its
//! engine. The surrounding runner calls [`ControlSequence::step`] until it
//! returns [`StepStatus::Complete`]; each call does a bounded amount of work:
//! one branch command during a pass, or one solver advance between passes.
//!
//! Run lifecycle:
//!
//! ```text
//! Idle/Complete --step--> Stepping --(pass phase)--> InPass --(pass done)--> Stepping
//!                            |                                                 |
//!                            +--(Finished)--> FinalPass --(pass done)--> Complete
//! ```

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::bridge::{CallbackBridge, ExternalEngine, Problem};
use crate::command::Command;
use crate::context::{ExecContext, SequenceEvent};
use crate::core::branch::Branch;
use crate::core::error::ControlError;
use crate::core::objects::ObjectStore;
use crate::core::phase::Phase;
use crate::core::snapshot::LoopSnapshot;
use crate::core::types::{EngineKind, SequenceKind, SolverStatus, StepStatus};
use crate::io::summary::SequenceSummary;
use crate::solver::Solver;

/// Where a sequence is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Never run, or aborted by an error.
    Idle,
    /// Between passes; the next step consults the solver phase.
    Stepping,
    /// Executing a pass requested in the given phase.
    InPass(Phase),
    /// Executing the one pass that follows `Finished`.
    FinalPass,
    Complete,
}

#[derive(Debug)]
pub struct ControlSequence {
    kind: SequenceKind,
    level: usize,
    solver: Box<dyn Solver>,
    engine: Option<Box<dyn ExternalEngine>>,
    branch: Branch,
    snapshot: LoopSnapshot<ObjectStore>,
    state: SequenceState,
    initialized: bool,
    converged: bool,
    report_progress: bool,
    progress: Vec<String>,
    runs: usize,
}

impl ControlSequence {
    pub fn new(kind: SequenceKind, solver: Box<dyn Solver>) -> Self {
        let branch = Branch::new(kind, solver.name(), 0);
        Self {
            kind,
            level: 0,
            solver,
            engine: None,
            branch,
            snapshot: LoopSnapshot::new(),
            state: SequenceState::Idle,
            initialized: false,
            converged: false,
            report_progress: true,
            progress: Vec::new(),
            runs: 0,
        }
    }

    /// Attach the engine that drives an external solver.
    pub fn with_engine(mut self, engine: Box<dyn ExternalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Whether per-iteration progress lines are written along with the final report.
    pub fn with_progress(mut self, report_progress: bool) -> Self {
        self.report_progress = report_progress;
        self
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn solver_name(&self) -> &str {
        self.solver.name()
    }

    pub fn solver(&self) -> &dyn Solver {
        self.solver.as_ref()
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) {
        self.level = level;
        self.branch.set_level(level);
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True once the solver reached `Finished` with a converged status.
    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn append(&mut self, command: Command) -> Result<(), ControlError> {
        self.branch.append(command)
    }

    /// Register every worker command with the solver and initialize it.
    ///
    /// Runs once; later calls are no-ops. Nested sequences are initialized
    /// along the way.
    #[instrument(skip_all, fields(solver = %self.solver.name(), level = self.level))]
    pub fn initialize(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ControlError> {
        if self.initialized {
            return Ok(());
        }
        if !self.branch.is_closed() {
            return Err(ControlError::BranchNotClosed { kind: self.kind });
        }
        let counts = self.branch.registration_counts();
        self.solver.set_counts(counts);
        for command in self.branch.commands_mut() {
            if let Some(registering) = command.as_registering_mut() {
                let registration = registering.registration(ctx.objects)?;
                let handle = self
                    .solver
                    .registry_mut()
                    .register(registration, self.level)?;
                registering.set_handle(handle);
            }
            if let Command::Sequence(nested) = command {
                nested.initialize(ctx)?;
            }
        }
        self.solver.initialize()?;
        self.initialized = true;
        debug!(?counts, "initialized");
        Ok(())
    }

    /// Advance the run by one step.
    ///
    /// Any error aborts the run: the sequence returns to `Idle`, and the next
    /// call starts over from a fresh initialization pass.
    #[instrument(skip_all, fields(solver = %self.solver.name()))]
    pub fn step(&mut self, ctx: &mut ExecContext<'_>) -> Result<StepStatus, ControlError> {
        let result = self.step_inner(ctx);
        if let Err(err) = &result {
            warn!(err = %err, state = ?self.state, "control sequence aborted");
            self.abort();
        }
        result
    }

    /// Drop any run in progress, including those of nested sequences.
    pub fn abort(&mut self) {
        self.state = SequenceState::Idle;
        self.branch.rewind();
        self.branch.abort_nested();
        self.snapshot.free();
    }

    fn step_inner(&mut self, ctx: &mut ExecContext<'_>) -> Result<StepStatus, ControlError> {
        if !self.initialized {
            self.initialize(ctx)?;
        }
        match self.state {
            SequenceState::Idle | SequenceState::Complete => {
                self.begin_run(ctx);
                self.dispatch(ctx)
            }
            SequenceState::Stepping => self.dispatch(ctx),
            SequenceState::InPass(phase) => self.pass_step(ctx, phase),
            SequenceState::FinalPass => self.final_step(ctx),
        }
    }

    fn begin_run(&mut self, ctx: &mut ExecContext<'_>) {
        self.snapshot.free();
        self.snapshot.store(ctx.objects);
        self.branch.rewind();
        self.solver.reset();
        self.converged = false;
        self.progress.clear();
        self.state = SequenceState::Stepping;
        self.runs += 1;
        info!(run = self.runs, "run started");
        ctx.emit(SequenceEvent::RunStarted {
            solver: self.solver.name().to_string(),
        });
    }

    fn dispatch(&mut self, ctx: &mut ExecContext<'_>) -> Result<StepStatus, ControlError> {
        let phase = self.solver.phase();
        let engine = self.solver.engine_kind();
        debug!(%phase, ?engine, "dispatch");
        ctx.emit(SequenceEvent::PhaseObserved {
            solver: self.solver.name().to_string(),
            phase,
        });
        match (engine, phase) {
            (_, Phase::Initializing) => {
                self.branch.rewind();
                self.branch.run_to_completion(ctx, self.solver.as_mut())?;
                self.snapshot.store(ctx.objects);
                self.converged = false;
                self.advance(ctx)?;
                Ok(StepStatus::Running)
            }
            (_, Phase::Nominal) | (EngineKind::Internal, Phase::Perturbing | Phase::RunSpecial) => {
                self.snapshot.reset(ctx.objects)?;
                self.branch.rewind();
                self.state = SequenceState::InPass(phase);
                ctx.emit(SequenceEvent::PassStarted {
                    solver: self.solver.name().to_string(),
                    phase,
                });
                self.pass_step(ctx, phase)
            }
            (
                EngineKind::Internal,
                Phase::Calculating | Phase::CheckingRun,
            ) => {
                self.advance(ctx)?;
                Ok(StepStatus::Running)
            }
            (EngineKind::External, Phase::RunExternal) => {
                self.run_external(ctx)?;
                self.transitioned(ctx, phase, self.solver.phase());
                Ok(StepStatus::Running)
            }
            (_, Phase::Finished) => {
                self.snapshot.reset(ctx.objects)?;
                self.branch.rewind();
                self.state = SequenceState::FinalPass;
                ctx.emit(SequenceEvent::PassStarted {
                    solver: self.solver.name().to_string(),
                    phase,
                });
                self.final_step(ctx)
            }
            (engine, phase) => Err(ControlError::UnexpectedPhase {
                solver: self.solver.name().to_string(),
                phase,
                engine: match engine {
                    EngineKind::Internal => "internal",
                    EngineKind::External => "external",
                },
            }),
        }
    }

    fn pass_step(
        &mut self,
        ctx: &mut ExecContext<'_>,
        phase: Phase,
    ) -> Result<StepStatus, ControlError> {
        if self.branch.execute_step(ctx, self.solver.as_mut())? == StepStatus::Complete {
            ctx.emit(SequenceEvent::PassCompleted {
                solver: self.solver.name().to_string(),
                phase,
            });
            self.state = SequenceState::Stepping;
            self.advance(ctx)?;
        }
        Ok(StepStatus::Running)
    }

    fn final_step(&mut self, ctx: &mut ExecContext<'_>) -> Result<StepStatus, ControlError> {
        if self.branch.execute_step(ctx, self.solver.as_mut())? == StepStatus::Running {
            return Ok(StepStatus::Running);
        }
        ctx.emit(SequenceEvent::PassCompleted {
            solver: self.solver.name().to_string(),
            phase: Phase::Finished,
        });
        self.snapshot.free();
        self.state = SequenceState::Complete;
        let status = self.solver.status();
        info!(%status, iterations = self.solver.iterations(), "run complete");
        ctx.emit(SequenceEvent::Completed {
            solver: self.solver.name().to_string(),
            status,
        });
        Ok(StepStatus::Complete)
    }

    /// Ask the solver for its next phase.
    fn advance(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ControlError> {
        let from = self.solver.phase();
        let to = self.solver.advance()?;
        self.transitioned(ctx, from, to);
        Ok(())
    }

    /// Reaching `Finished` flushes the buffered progress text and the final
    /// report to the sink.
    fn transitioned(&mut self, ctx: &mut ExecContext<'_>, from: Phase, to: Phase) {
        self.progress.extend(self.solver.drain_progress());
        ctx.emit(SequenceEvent::Advanced {
            solver: self.solver.name().to_string(),
            from,
            to,
        });
        if to == Phase::Finished && from != Phase::Finished {
            self.converged = self.solver.status() == SolverStatus::Converged;
            if self.converged {
                ctx.emit(SequenceEvent::Converged {
                    solver: self.solver.name().to_string(),
                    iterations: self.solver.iterations(),
                });
            }
            let progress = std::mem::take(&mut self.progress);
            if self.report_progress {
                for line in &progress {
                    ctx.sink.report(line);
                }
            }
            for line in self.solver.final_report() {
                ctx.sink.report(&line);
            }
        }
    }

    fn run_external(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ControlError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| ControlError::EngineUnavailable {
                solver: self.solver.name().to_string(),
            })?;
        let problem = Problem::from_registry(self.solver.name(), self.solver.registry());
        info!(
            engine = engine.name(),
            variables = problem.variables.len(),
            "handing control to external engine"
        );
        let verdict = {
            let mut bridge = CallbackBridge::new(
                self.solver.as_mut(),
                &mut self.branch,
                &mut self.snapshot,
                ctx.reborrow(),
            );
            engine.run(&problem, &mut bridge)?
        };
        self.solver.finish_external(&verdict)
    }

    /// Record of the last run for the run summary.
    pub fn summary(&self) -> SequenceSummary {
        let registry = self.solver.registry();
        let variables: BTreeMap<String, f64> = registry
            .variable_specs()
            .zip(registry.variable_values())
            .map(|(spec, value)| (spec.name.clone(), value))
            .collect();
        SequenceSummary {
            kind: self.kind,
            solver: self.solver.name().to_string(),
            solver_type: self.solver.type_name().to_string(),
            converged: self.converged,
            status: self.solver.status(),
            iterations: self.solver.iterations(),
            variables,
        }
    }
}
