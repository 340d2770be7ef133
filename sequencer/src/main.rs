//! Mission sequencer.
//!
//! Runs mission scripts whose `Target`/`Optimize` sequences are driven by
//! differential correctors, optimizers or external optimization engines.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use sequencer::bridge::verbs::{Channel, serve};
use sequencer::context::{Console, Interrupt};
use sequencer::exit_codes;
use sequencer::io::config::{DEFAULT_CONFIG_PATH, SequencerConfig, load_config};
use sequencer::io::engine::ProcessEngineFactory;
use sequencer::io::summary::write_summary;
use sequencer::logging;
use sequencer::mission::{RunLimits, run_mission};
use sequencer::script::{BuildOptions, Mission, parse_script};
use sequencer::session::Session;

#[derive(Parser)]
#[command(
    name = "sequencer",
    version,
    about = "Run mission scripts with targeting and optimization sequences"
)]
struct Cli {
    /// Config file; defaults apply if it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a mission script to completion.
    Run {
        script: PathBuf,
        /// Write a JSON run summary to this path.
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Parse a mission script and build its sequences without running them.
    Check { script: PathBuf },
    /// Speak the verb channel on stdin/stdout.
    Serve,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Run { script, summary } => cmd_run(&config, &script, summary.as_deref()),
        Command::Check { script } => cmd_check(&config, &script),
        Command::Serve => cmd_serve(config),
    }
}

fn build(
    config: &SequencerConfig,
    engines: &ProcessEngineFactory,
    script: &Path,
) -> Result<Mission> {
    let text =
        fs::read_to_string(script).with_context(|| format!("read script {}", script.display()))?;
    let mission = parse_script(
        &text,
        BuildOptions {
            defaults: &config.defaults,
            report_progress: config.report.progress,
            engines: Some(engines),
        },
    )
    .with_context(|| format!("build {}", script.display()))?;
    Ok(mission)
}

fn cmd_run(config: &SequencerConfig, script: &Path, summary_path: Option<&Path>) -> Result<i32> {
    let engines = ProcessEngineFactory::new(config.engine.clone());
    let mut mission = build(config, &engines, script)?;
    let limits = RunLimits {
        max_steps_per_sequence: config.max_steps_per_sequence,
    };
    let mut summary = run_mission(&mut mission, &mut Console, &Interrupt::new(), limits)
        .with_context(|| format!("run {}", script.display()))?;
    summary.script = Some(script.display().to_string());
    if let Some(path) = summary_path {
        write_summary(path, &summary)?;
    }
    debug!(steps = summary.steps, "run finished");
    Ok(if summary.all_converged() {
        exit_codes::OK
    } else {
        exit_codes::NOT_CONVERGED
    })
}

fn cmd_check(config: &SequencerConfig, script: &Path) -> Result<i32> {
    let engines = ProcessEngineFactory::new(config.engine.clone());
    let mission = build(config, &engines, script)?;
    for sequence in mission.sequences() {
        let counts = sequence.branch().registration_counts();
        println!(
            "{} {}: {} variables, {} objectives, {} equalities, {} inequalities",
            sequence.kind(),
            sequence.solver_name(),
            counts.variables,
            counts.objectives,
            counts.equalities,
            counts.inequalities
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_serve(config: SequencerConfig) -> Result<i32> {
    let engines = ProcessEngineFactory::new(config.engine.clone());
    let session = Session::new(config).with_engines(Box::new(engines));
    let mut channel = Channel::new(session);
    serve(&mut channel, io::stdin().lock(), io::stdout().lock())?;
    Ok(exit_codes::OK)
}
