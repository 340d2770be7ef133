//! Reference external optimization engine.
//!
//! Reads `Problem <json>` from stdin, then drives the sequencer through the
//! verb channel: each evaluation is `CallbackData <values>`, `Callback;` and
//! `?CallbackResults`, written to stdout with the reply read from stdin.
//! Exits 0 when the search converged.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;

use sequencer::bridge::secant::{SearchSettings, format_candidate, search};
use sequencer::bridge::{Problem, parse_results};
use sequencer::exit_codes;

#[derive(Parser)]
#[command(name = "secant-engine", version, about = "Reference external optimization engine")]
struct Cli {
    /// Residual tolerance (roots) or bracket width (minima).
    #[arg(long, default_value_t = 1e-10)]
    tolerance: f64,

    #[arg(long, default_value_t = 100)]
    max_evaluations: usize,
}

struct Link<R, W> {
    replies: R,
    requests: W,
}

impl<R: BufRead, W: Write> Link<R, W> {
    fn ask(&mut self, request: &str) -> Result<String> {
        writeln!(self.requests, "{request}").context("write request")?;
        self.requests.flush().context("flush request")?;
        let mut reply = String::new();
        let n = self.replies.read_line(&mut reply).context("read reply")?;
        if n == 0 {
            bail!("sequencer closed the channel after '{request}'");
        }
        Ok(reply.trim_end().to_string())
    }

    fn expect_ok(&mut self, request: &str) -> Result<()> {
        let reply = self.ask(request)?;
        if reply != "OK" {
            bail!("'{request}' failed: {reply}");
        }
        Ok(())
    }

    fn evaluate(&mut self, candidate: &[f64]) -> Result<Vec<f64>> {
        self.expect_ok(&format!("CallbackData {}", format_candidate(candidate)))?;
        self.expect_ok("Callback;")?;
        let results = self.ask("?CallbackResults")?;
        Ok(parse_results(&results)?)
    }
}

fn main() {
    match run() {
        Ok(true) => std::process::exit(exit_codes::OK),
        Ok(false) => std::process::exit(exit_codes::NOT_CONVERGED),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();
    let settings = SearchSettings {
        tolerance: cli.tolerance,
        max_evaluations: cli.max_evaluations,
    };
    let stdin = io::stdin();
    let mut link = Link {
        replies: stdin.lock(),
        requests: io::stdout().lock(),
    };

    let mut first = String::new();
    link.replies.read_line(&mut first).context("read problem")?;
    let json = first
        .trim_end()
        .strip_prefix("Problem ")
        .ok_or_else(|| anyhow!("expected 'Problem <json>' as the first line"))?;
    let problem: Problem = serde_json::from_str(json).context("parse problem")?;

    let outcome = search(&problem, &settings, |candidate| link.evaluate(candidate))?;
    eprintln!("{}", outcome.message);
    Ok(outcome.converged)
}
