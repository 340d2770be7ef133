//! External optimizers backed by the `secant-engine` child process.

use approx::assert_relative_eq;

use sequencer::context::SequenceEvent;
use sequencer::core::error::ControlError;
use sequencer::core::types::SolverStatus;
use sequencer::io::config::EngineConfig;
use sequencer::io::engine::ProcessEngineFactory;
use sequencer::test_support::{build_with, run};

fn script(command: &str) -> String {
    format!(
        "\
Create Variable v
Create Variable f
Create ExternalOptimizer Opt
Opt.Command = '{command}'
Opt.RequestTimeout = 20
v = 5
BeginMissionSequence
Optimize Opt
   Vary Opt(v = 5, {{Lower = 0, Upper = 10}})
   f = v^2
   Minimize Opt(f)
   NonlinearConstraint Opt(v - 3 = 0)
EndOptimize
"
    )
}

fn engine() -> &'static str {
    env!("CARGO_BIN_EXE_secant-engine")
}

#[test]
fn child_engine_drives_the_sequence_to_convergence() {
    let factory = ProcessEngineFactory::new(EngineConfig::default());
    let mut mission = build_with(&script(engine()), Some(&factory)).expect("build");
    let (transcript, result) = run(&mut mission);
    let summary = result.expect("run");

    let record = &summary.sequences[0];
    assert!(record.converged, "{}", transcript.text());
    assert_eq!(record.status, SolverStatus::Converged);
    assert_relative_eq!(record.variables["v"], 3.0, epsilon = 1e-9);
    assert_relative_eq!(mission.objects.get("f").expect("f"), 9.0, epsilon = 1e-8);
    let callbacks =
        transcript.count(|event| matches!(event, SequenceEvent::CallbackServed { .. }));
    assert!(callbacks >= 2);
    assert!(
        transcript.text().contains("root found"),
        "{}",
        transcript.text()
    );
}

#[test]
fn nonzero_exit_is_reported_as_not_converged() {
    let command = format!("{} --max-evaluations 1", engine());
    let factory = ProcessEngineFactory::new(EngineConfig::default());
    let mut mission = build_with(&script(&command), Some(&factory)).expect("build");
    let (transcript, result) = run(&mut mission);
    let summary = result.expect("run");

    let record = &summary.sequences[0];
    assert!(!record.converged);
    assert_eq!(record.status, SolverStatus::EngineStopped);
    assert!(
        transcript.text().contains("evaluation limit reached"),
        "{}",
        transcript.text()
    );
}

#[test]
fn missing_engine_program_fails_the_run() {
    let factory = ProcessEngineFactory::new(EngineConfig::default());
    let mut mission =
        build_with(&script("/nonexistent/secant-engine"), Some(&factory)).expect("build");
    let (_, result) = run(&mut mission);
    assert!(matches!(result, Err(ControlError::Engine(_))));
}
