//! Test-only helpers for building and running missions.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::bridge::secant::{SearchSettings, SecantEngine, format_candidate};
use crate::bridge::{
    CallbackHandler, EngineFactory, EngineVerdict, ExternalEngine, Problem, parse_results,
};
use crate::context::{Interrupt, Transcript};
use crate::core::error::ControlError;
use crate::io::summary::RunSummary;
use crate::mission::{RunLimits, run_mission};
use crate::script::{BuildOptions, Mission, parse_script};
use crate::solver::{ExternalSettings, SolverDefaults};

/// Parse `text` with default solver settings and no engines.
pub fn build(text: &str) -> Result<Mission, ControlError> {
    build_with(text, None)
}

/// Parse `text` with default solver settings and the given engine factory.
pub fn build_with(
    text: &str,
    engines: Option<&dyn EngineFactory>,
) -> Result<Mission, ControlError> {
    let defaults = SolverDefaults::default();
    parse_script(
        text,
        BuildOptions {
            defaults: &defaults,
            report_progress: true,
            engines,
        },
    )
}

/// Run a parsed mission into a fresh transcript.
pub fn run(mission: &mut Mission) -> (Transcript, Result<RunSummary, ControlError>) {
    let mut transcript = Transcript::new();
    let interrupt = Interrupt::new();
    let result = run_mission(mission, &mut transcript, &interrupt, RunLimits::default());
    (transcript, result)
}

/// Factory producing the in-process reference engine for every solver.
pub fn secant_factory(
) -> impl Fn(&str, &ExternalSettings) -> Result<Box<dyn ExternalEngine>, ControlError> {
    |_solver: &str, _settings: &ExternalSettings| -> Result<Box<dyn ExternalEngine>, ControlError> {
        Ok(Box::new(SecantEngine::new(SearchSettings::default())))
    }
}

/// Record of what a [`ScriptedEngine`] sent and received.
#[derive(Debug, Default)]
pub struct EngineLog {
    pub problems: Vec<Problem>,
    pub payloads: Vec<String>,
    pub results: Vec<Vec<f64>>,
}

/// Engine that evaluates a fixed list of candidates, then reports a verdict.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    pub candidates: Vec<Vec<f64>>,
    pub converged: bool,
    pub log: Rc<RefCell<EngineLog>>,
}

impl ScriptedEngine {
    pub fn new(candidates: Vec<Vec<f64>>, converged: bool) -> Self {
        Self {
            candidates,
            converged,
            log: Rc::new(RefCell::new(EngineLog::default())),
        }
    }
}

impl ExternalEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(
        &mut self,
        problem: &Problem,
        handler: &mut dyn CallbackHandler,
    ) -> Result<EngineVerdict, ControlError> {
        self.log.borrow_mut().problems.push(problem.clone());
        for candidate in &self.candidates {
            let payload = format_candidate(candidate);
            self.log.borrow_mut().payloads.push(payload.clone());
            let text = handler.execute_callback(&payload)?;
            self.log.borrow_mut().results.push(parse_results(&text)?);
        }
        Ok(EngineVerdict {
            converged: self.converged,
            best: self.candidates.last().cloned(),
            message: Some("scripted".to_string()),
        })
    }
}

/// Temporary directory holding script, config and summary files.
pub struct ScriptDir {
    dir: TempDir,
}

impl ScriptDir {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create temp dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `text` to `name` inside the directory and return its path.
    pub fn write(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
