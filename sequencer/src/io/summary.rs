//! JSON run summary written by `sequencer run --summary`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{SequenceKind, SolverStatus};

/// Outcome of one top-level control sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceSummary {
    pub kind: SequenceKind,
    pub solver: String,
    pub solver_type: String,
    pub converged: bool,
    pub status: SolverStatus,
    pub iterations: usize,
    /// Final variable values by name.
    pub variables: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// Script the mission was built from.
    pub script: Option<String>,
    /// Mission steps executed, across all commands.
    pub steps: u64,
    pub sequences: Vec<SequenceSummary>,
}

impl RunSummary {
    /// True when every control sequence converged.
    pub fn all_converged(&self) -> bool {
        self.sequences.iter().all(|sequence| sequence.converged)
    }
}

pub fn load_summary(path: &Path) -> Result<RunSummary> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read summary {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse summary {}", path.display()))
}

/// Atomically write the summary (temp file + rename).
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    debug!(path = %path.display(), sequences = summary.sequences.len(), "writing run summary");
    let mut buf = serde_json::to_string_pretty(summary).context("serialize summary")?;
    buf.push('\n');
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp summary {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace summary {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trips_with_snake_case_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out/summary.json");
        let summary = RunSummary {
            script: Some("mission.script".into()),
            steps: 12,
            sequences: vec![SequenceSummary {
                kind: SequenceKind::Target,
                solver: "DC1".into(),
                solver_type: "DifferentialCorrector".into(),
                converged: false,
                status: SolverStatus::ExceededIterations,
                iterations: 25,
                variables: BTreeMap::from([("v".to_string(), 2.5)]),
            }],
        };
        write_summary(&path, &summary).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("\"status\": \"exceeded_iterations\""));
        assert!(contents.ends_with("}\n"));
        assert_eq!(load_summary(&path).expect("load"), summary);
        assert!(!summary.all_converged());
    }
}
