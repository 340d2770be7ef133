//! Sequencer configuration stored in `.sequencer/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::solver::SolverDefaults;

/// Default location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".sequencer/config.toml";

/// Sequencer configuration (TOML).
///
/// Missing fields take their defaults, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SequencerConfig {
    /// Steps a single mission command may take before the run is abandoned.
    pub max_steps_per_sequence: u64,

    /// Solver and worker-command defaults for fields a script leaves unset.
    pub defaults: SolverDefaults,

    pub engine: EngineConfig,

    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine launched for an `ExternalOptimizer` without a `Command` field.
    pub command: Vec<String>,

    /// Per-request wait for the engine's next line.
    pub request_timeout_secs: u64,

    /// Bytes of engine stderr kept for error messages.
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["secant-engine".to_string()],
            request_timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Print per-iteration solver progress, not only the final report.
    pub progress: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { progress: true }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_steps_per_sequence: 100_000,
            defaults: SolverDefaults::default(),
            engine: EngineConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl SequencerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps_per_sequence == 0 {
            return Err(anyhow!("max_steps_per_sequence must be > 0"));
        }
        if self.defaults.max_iterations == 0 {
            return Err(anyhow!("defaults.max_iterations must be > 0"));
        }
        if !(self.defaults.perturbation.is_finite() && self.defaults.perturbation != 0.0) {
            return Err(anyhow!("defaults.perturbation must be a non-zero number"));
        }
        if !(self.defaults.tolerance.is_finite() && self.defaults.tolerance > 0.0) {
            return Err(anyhow!("defaults.tolerance must be > 0"));
        }
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(anyhow!("engine.request_timeout_secs must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SequencerConfig::default()`.
pub fn load_config(path: &Path) -> Result<SequencerConfig> {
    if !path.exists() {
        let cfg = SequencerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SequencerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SequencerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SequencerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = SequencerConfig::default();
        cfg.defaults.max_iterations = 40;
        cfg.report.progress = false;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[engine]\nrequest_timeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.request_timeout_secs, 5);
        assert_eq!(cfg.engine.command, vec!["secant-engine".to_string()]);
        assert_eq!(cfg.max_steps_per_sequence, 100_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[defaults]\ntolerance = 0.0\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
