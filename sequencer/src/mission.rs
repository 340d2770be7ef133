//! Cooperative run loop over a parsed mission.
//!
//! Top-level commands run in order; each is stepped until it reports
//! [`StepStatus::Complete`]. The interrupt flag is checked before every step,
//! and a per-command step limit stops a runaway sequence.

use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::context::{ExecContext, Interrupt, Sink};
use crate::core::error::ControlError;
use crate::core::types::StepStatus;
use crate::io::summary::RunSummary;
use crate::script::Mission;

/// Limits for [`run_mission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_steps_per_sequence: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps_per_sequence: 100_000,
        }
    }
}

/// Run every top-level command of `mission` to completion.
///
/// Stops at the first error. A sequence interrupted or stopped by the step
/// limit is aborted, so running the mission again starts it over.
#[instrument(skip_all, fields(commands = mission.commands.len()))]
pub fn run_mission(
    mission: &mut Mission,
    sink: &mut dyn Sink,
    interrupt: &Interrupt,
    limits: RunLimits,
) -> Result<RunSummary, ControlError> {
    let mut summary = RunSummary::default();
    let Mission {
        objects, commands, ..
    } = mission;
    let mut ctx = ExecContext::new(objects, sink, interrupt);

    for command in commands {
        let steps = run_command(command, &mut ctx, limits)?;
        summary.steps += steps;
        if let Command::Sequence(sequence) = command {
            let record = sequence.summary();
            info!(
                solver = %record.solver,
                converged = record.converged,
                iterations = record.iterations,
                steps,
                "sequence finished"
            );
            summary.sequences.push(record);
        }
    }
    debug!(steps = summary.steps, "mission complete");
    Ok(summary)
}

fn run_command(
    command: &mut Command,
    ctx: &mut ExecContext<'_>,
    limits: RunLimits,
) -> Result<u64, ControlError> {
    let mut steps = 0u64;
    loop {
        if ctx.interrupt.is_set() {
            warn!(command = command.keyword(), "interrupted");
            abort(command);
            return Err(ControlError::Interrupted);
        }
        if steps >= limits.max_steps_per_sequence {
            warn!(command = command.keyword(), steps, "step limit reached");
            abort(command);
            return Err(ControlError::StepLimit {
                command: command.keyword(),
                limit: limits.max_steps_per_sequence,
            });
        }
        steps += 1;
        if command.execute(ctx, None)? == StepStatus::Complete {
            return Ok(steps);
        }
    }
}

fn abort(command: &mut Command) {
    if let Command::Sequence(sequence) = command {
        sequence.abort();
    }
}
