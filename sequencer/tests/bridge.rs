//! Callback bridge behaviour as seen by an external engine.

use approx::assert_relative_eq;

use sequencer::bridge::ExternalEngine;
use sequencer::context::SequenceEvent;
use sequencer::core::error::ControlError;
use sequencer::core::types::{Role, SolverStatus};
use sequencer::solver::ExternalSettings;
use sequencer::test_support::{ScriptedEngine, build_with, run};

const SCRIPT: &str = "\
Create Variable v
Create Variable f
Create Variable k
Create ExternalOptimizer Ext
v = 5
BeginMissionSequence
Optimize Ext
   Vary Ext(v = 5, {Lower = 0, Upper = 10})
   k = k + 1
   f = v^2
   NonlinearConstraint Ext(v - 3 = 0)
   Minimize Ext(f)
EndOptimize
";

fn factory(
    engine: &ScriptedEngine,
) -> impl Fn(&str, &ExternalSettings) -> Result<Box<dyn ExternalEngine>, ControlError> {
    let engine = engine.clone();
    move |_solver: &str, _settings: &ExternalSettings| {
        Ok(Box::new(engine.clone()) as Box<dyn ExternalEngine>)
    }
}

#[test]
fn engine_receives_the_problem_and_evaluated_results() {
    let engine = ScriptedEngine::new(vec![vec![4.0], vec![3.0]], true);
    let factory = factory(&engine);
    let mut mission = build_with(SCRIPT, Some(&factory)).expect("build");
    let (transcript, result) = run(&mut mission);
    let summary = result.expect("run");

    let log = engine.log.borrow();
    assert_eq!(log.problems.len(), 1);
    let problem = &log.problems[0];
    assert_eq!(problem.solver, "Ext");
    assert_eq!(problem.variables[0].name, "v");
    assert_eq!(problem.variables[0].initial, 5.0);
    assert_eq!(problem.variables[0].lower, Some(0.0));
    assert_eq!(problem.variables[0].upper, Some(10.0));
    let roles: Vec<Role> = problem.results.iter().map(|r| r.role).collect();
    assert_eq!(roles, vec![Role::Objective, Role::EqualityConstraint]);

    // Objective first even though the constraint was registered first.
    assert_eq!(log.payloads, vec!["4".to_string(), "3".to_string()]);
    assert_eq!(log.results, vec![vec![16.0, 1.0], vec![9.0, 0.0]]);

    let record = &summary.sequences[0];
    assert!(record.converged);
    assert_eq!(record.iterations, 2);
    assert_relative_eq!(record.variables["v"], 3.0);
    assert_eq!(
        transcript.count(|event| matches!(event, SequenceEvent::CallbackServed { .. })),
        2
    );
}

#[test]
fn every_callback_starts_from_the_snapshot() {
    let engine = ScriptedEngine::new(vec![vec![1.0], vec![2.0], vec![3.0]], true);
    let factory = factory(&engine);
    let mut mission = build_with(SCRIPT, Some(&factory)).expect("build");
    let (_, result) = run(&mut mission);
    result.expect("run");

    // One initialization pass plus the final pass, however many callbacks.
    assert_eq!(mission.objects.get("k").expect("k"), 2.0);
    assert_eq!(mission.objects.get("f").expect("f"), 9.0);
}

#[test]
fn unconverged_verdict_still_applies_the_best_point() {
    let engine = ScriptedEngine::new(vec![vec![7.0]], false);
    let factory = factory(&engine);
    let mut mission = build_with(SCRIPT, Some(&factory)).expect("build");
    let (transcript, result) = run(&mut mission);
    let summary = result.expect("run");

    let record = &summary.sequences[0];
    assert!(!record.converged);
    assert_eq!(record.status, SolverStatus::EngineStopped);
    assert_eq!(mission.objects.get("v").expect("v"), 7.0);
    assert_eq!(mission.objects.get("f").expect("f"), 49.0);
    assert!(transcript.text().contains("engine: scripted"));
}

#[test]
fn payload_with_the_wrong_count_aborts_the_run() {
    let engine = ScriptedEngine::new(vec![vec![1.0, 2.0]], true);
    let factory = factory(&engine);
    let mut mission = build_with(SCRIPT, Some(&factory)).expect("build");
    let (_, result) = run(&mut mission);
    assert!(matches!(result, Err(ControlError::Payload { .. })));
    assert!(engine.log.borrow().results.is_empty());

    let sequence = mission.sequences().next().expect("sequence");
    assert!(!sequence.converged());
}
