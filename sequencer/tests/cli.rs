//! CLI tests for `sequencer run` and `sequencer check`.
//!
//! Spawns the binary and checks exit codes and the JSON run summary.

use std::process::Command;

use sequencer::exit_codes;
use sequencer::io::summary::load_summary;
use sequencer::test_support::ScriptDir;

const TARGET: &str = "\
Create Variable v
Create Variable c
Create DifferentialCorrector DC1
v = 5
BeginMissionSequence
Target DC1
   Vary DC1(v = 5)
   c = v - 3
   Achieve DC1(c = 0, {Tolerance = 1e-9})
EndTarget
Report v c
";

#[test]
fn converged_run_exits_ok_and_writes_summary() {
    let dir = ScriptDir::new().expect("dir");
    let script = dir.write("mission.script", TARGET).expect("script");
    let summary_path = dir.path().join("out/summary.json");

    let output = Command::new(env!("CARGO_BIN_EXE_sequencer"))
        .current_dir(dir.path())
        .arg("run")
        .arg(&script)
        .arg("--summary")
        .arg(&summary_path)
        .output()
        .expect("sequencer run");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("iterationsTaken"), "{stdout}");
    assert!(
        stdout.lines().any(|line| line.starts_with("v = ")),
        "{stdout}"
    );

    let summary = load_summary(&summary_path).expect("summary");
    assert!(summary.all_converged());
    assert_eq!(summary.sequences[0].solver, "DC1");
    assert!(summary.script.is_some_and(|s| s.ends_with("mission.script")));
}

#[test]
fn unconverged_run_exits_not_converged() {
    let dir = ScriptDir::new().expect("dir");
    let text = TARGET
        .replace("v = 5\nBegin", "DC1.MaximumIterations = 1\nv = 5\nBegin")
        .replace("Vary DC1(v = 5)", "Vary DC1(v = 5, {MaxStep = 0.1})");
    let script = dir.write("mission.script", &text).expect("script");

    let status = Command::new(env!("CARGO_BIN_EXE_sequencer"))
        .current_dir(dir.path())
        .arg("run")
        .arg(&script)
        .status()
        .expect("sequencer run");

    assert_eq!(status.code(), Some(exit_codes::NOT_CONVERGED));
}

#[test]
fn invalid_script_exits_invalid() {
    let dir = ScriptDir::new().expect("dir");
    let script = dir
        .write(
            "broken.script",
            "Create Variable v\nBeginMissionSequence\nTarget DC1\n",
        )
        .expect("script");

    let output = Command::new(env!("CARGO_BIN_EXE_sequencer"))
        .current_dir(dir.path())
        .arg("check")
        .arg(&script)
        .output()
        .expect("sequencer check");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!output.stderr.is_empty());
}

#[test]
fn check_lists_registration_counts() {
    let dir = ScriptDir::new().expect("dir");
    let script = dir.write("mission.script", TARGET).expect("script");
    let config = dir
        .write("sequencer.toml", "[defaults]\nmax_iterations = 10\n")
        .expect("config");

    let output = Command::new(env!("CARGO_BIN_EXE_sequencer"))
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("check")
        .arg(&script)
        .output()
        .expect("sequencer check");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DC1: 1 variables, 0 objectives, 1 equalities, 0 inequalities"),
        "{stdout}"
    );
}
