//! Execution context shared by every command step.
//!
//! Commands never touch stdout or global state directly. They read and write
//! the object store, emit progress lines and events through a [`Sink`], and
//! check the [`Interrupt`] flag the host may raise between steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::objects::ObjectStore;
use crate::core::phase::Phase;
use crate::core::types::SolverStatus;

/// Notable state changes of a control sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    RunStarted { solver: String },
    /// Phase read from the solver when the sequence dispatched on it.
    PhaseObserved { solver: String, phase: Phase },
    PassStarted { solver: String, phase: Phase },
    PassCompleted { solver: String, phase: Phase },
    Advanced {
        solver: String,
        from: Phase,
        to: Phase,
    },
    Converged { solver: String, iterations: usize },
    Completed {
        solver: String,
        status: SolverStatus,
    },
    CallbackServed { solver: String, callbacks: usize },
}

/// Receives product output: solver progress text and sequence events.
pub trait Sink {
    fn report(&mut self, line: &str);

    fn event(&mut self, _event: &SequenceEvent) {}
}

/// Prints progress text to stdout and ignores events.
#[derive(Debug, Default)]
pub struct Console;

impl Sink for Console {
    fn report(&mut self, line: &str) {
        println!("{line}");
    }
}

/// In-memory sink that records everything; used by tests and the verb host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub lines: Vec<String>,
    pub events: Vec<SequenceEvent>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phases in the order they were observed at dispatch.
    pub fn observed_phases(&self) -> Vec<Phase> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SequenceEvent::PhaseObserved { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&SequenceEvent) -> bool) -> usize {
        self.events.iter().filter(|event| pred(event)).count()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl Sink for Transcript {
    fn report(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn event(&mut self, event: &SequenceEvent) {
        self.events.push(event.clone());
    }
}

/// User interrupt flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Borrowed view of everything a command needs while it executes.
pub struct ExecContext<'a> {
    pub objects: &'a mut ObjectStore,
    pub sink: &'a mut dyn Sink,
    pub interrupt: &'a Interrupt,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        objects: &'a mut ObjectStore,
        sink: &'a mut dyn Sink,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            objects,
            sink,
            interrupt,
        }
    }

    /// Shorter-lived copy of this context, for handing to a nested call.
    pub fn reborrow(&mut self) -> ExecContext<'_> {
        ExecContext {
            objects: &mut *self.objects,
            sink: &mut *self.sink,
            interrupt: self.interrupt,
        }
    }

    pub fn emit(&mut self, event: SequenceEvent) {
        self.sink.event(&event);
    }
}
