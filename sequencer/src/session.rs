//! Verb-channel host for `sequencer serve`.
//!
//! A session keeps one built mission. `Build;` replaces it, `Update;`
//! replaces only its object values, and `Run;` runs it to completion.
//! Mission output is collected in a transcript rather than written to
//! stdout, which carries the channel replies.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::bridge::verbs::{Host, RunState};
use crate::bridge::{CallbackStatus, EngineFactory};
use crate::context::{Interrupt, Transcript};
use crate::core::error::ControlError;
use crate::io::config::SequencerConfig;
use crate::io::summary::RunSummary;
use crate::mission::{RunLimits, run_mission};
use crate::script::{BuildOptions, Mission, parse_script};

pub struct Session {
    config: SequencerConfig,
    engines: Option<Box<dyn EngineFactory>>,
    mission: Option<Mission>,
    transcript: Transcript,
    interrupt: Interrupt,
    state: RunState,
    last_summary: Option<RunSummary>,
}

impl Session {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            engines: None,
            mission: None,
            transcript: Transcript::new(),
            interrupt: Interrupt::new(),
            state: RunState::Idle,
            last_summary: None,
        }
    }

    pub fn with_engines(mut self, engines: Box<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Flag that pauses a running mission at its next step.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    fn parse(&self, script: &str) -> Result<Mission, ControlError> {
        parse_script(
            script,
            BuildOptions {
                defaults: &self.config.defaults,
                report_progress: self.config.report.progress,
                engines: self.engines.as_deref(),
            },
        )
    }
}

impl Host for Session {
    fn clear(&mut self) -> Result<()> {
        self.mission = None;
        self.transcript = Transcript::new();
        self.last_summary = None;
        self.state = RunState::Idle;
        Ok(())
    }

    #[instrument(skip_all)]
    fn build(&mut self, script: &str) -> Result<()> {
        let mission = self.parse(script)?;
        debug!(commands = mission.commands.len(), "mission built");
        self.mission = Some(mission);
        self.state = RunState::Idle;
        Ok(())
    }

    #[instrument(skip_all)]
    fn update(&mut self, script: &str) -> Result<()> {
        let update = self.parse(script)?;
        let mission = self
            .mission
            .as_mut()
            .ok_or_else(|| anyhow!("Update; needs a mission (send Build; first)"))?;
        mission.objects = update.objects;
        Ok(())
    }

    #[instrument(skip_all)]
    fn run(&mut self) -> Result<()> {
        let mission = self
            .mission
            .as_mut()
            .ok_or_else(|| anyhow!("Run; needs a mission (send Build; first)"))?;
        self.interrupt.clear();
        self.state = RunState::Running;
        let limits = RunLimits {
            max_steps_per_sequence: self.config.max_steps_per_sequence,
        };
        match run_mission(mission, &mut self.transcript, &self.interrupt, limits) {
            Ok(summary) => {
                info!(
                    sequences = summary.sequences.len(),
                    converged = summary.all_converged(),
                    "mission run finished"
                );
                self.last_summary = Some(summary);
                self.state = RunState::Idle;
                Ok(())
            }
            Err(ControlError::Interrupted) => {
                warn!("mission paused by interrupt");
                self.state = RunState::Paused;
                Ok(())
            }
            Err(err) => {
                self.state = RunState::Idle;
                Err(err.into())
            }
        }
    }

    fn callback(&mut self, _payload: &str) -> Result<String> {
        Err(anyhow!("no external engine callback is registered"))
    }

    fn run_state(&self) -> RunState {
        self.state
    }

    fn callback_status(&self) -> CallbackStatus {
        CallbackStatus::Completed
    }

    fn callback_results(&self) -> Option<String> {
        None
    }

    fn query(&self, name: &str) -> Option<f64> {
        self.mission.as_ref()?.objects.get(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::verbs::{Channel, NO_CALLBACK, UNKNOWN_VALUE};

    #[test]
    fn build_and_run_over_the_channel() {
        let mut channel = Channel::new(Session::new(SequencerConfig::default()));
        for line in [
            "Create Variable v",
            "Create Variable c",
            "Create DifferentialCorrector DC1",
            "v = 5",
            "BeginMissionSequence",
            "Target DC1",
            "Vary DC1(v = 5)",
            "c = v - 3",
            "Achieve DC1(c = 0, {Tolerance = 1e-9})",
            "EndTarget",
        ] {
            assert_eq!(channel.handle_line(line), "OK");
        }
        assert_eq!(channel.handle_line("?v"), UNKNOWN_VALUE);
        assert_eq!(channel.handle_line("Build+Run;"), "OK");
        assert_eq!(channel.handle_line("?RunState"), "Idle");
        let reply = channel.handle_line("?v");
        let value: f64 = reply
            .trim_matches(['[', ']'])
            .parse()
            .expect("bracketed value");
        assert!((value - 3.0).abs() < 1e-6);
        assert_eq!(channel.handle_line("?CallbackResults"), NO_CALLBACK);
        let summary = channel.host().last_summary();
        assert!(summary.is_some_and(RunSummary::all_converged));
    }

    #[test]
    fn update_replaces_object_values_only() {
        let mut channel = Channel::new(Session::new(SequencerConfig::default()));
        channel.handle_line("Create Variable v");
        channel.handle_line("v = 1");
        assert_eq!(channel.handle_line("Build;"), "OK");
        channel.handle_line("Create Variable v");
        channel.handle_line("v = 9");
        assert_eq!(channel.handle_line("Update;"), "OK");
        assert_eq!(channel.handle_line("?v"), "[9]");
    }

    #[test]
    fn run_without_a_mission_is_an_error() {
        let mut channel = Channel::new(Session::new(SequencerConfig::default()));
        assert!(channel.handle_line("Run;").starts_with("ERROR:"));
        assert!(channel.handle_line("Callback;").starts_with("ERROR:"));
    }
}
