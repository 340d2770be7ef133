//! External engines that run as child processes.
//!
//! The child receives one `Problem <json>` line on stdin, then speaks the verb
//! channel: every line it writes to stdout is a request (`CallbackData ...`,
//! `Callback;`, `?CallbackResults`, `?name`), and every request is answered
//! with one line on its stdin. The exit status decides convergence.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::bridge::verbs::{Channel, Host, RunState};
use crate::bridge::{
    CallbackHandler, CallbackStatus, EngineFactory, EngineVerdict, ExternalEngine, Problem,
    parse_payload,
};
use crate::core::error::ControlError;
use crate::io::config::EngineConfig;
use crate::solver::ExternalSettings;

/// Verb-channel host that forwards callbacks to the control sequence.
///
/// Engines may only evaluate and query; rebuilding the mission from inside a
/// run is refused.
struct CallbackHost<'h> {
    handler: &'h mut dyn CallbackHandler,
    failure: Option<ControlError>,
    last_candidate: Option<String>,
}

impl<'h> CallbackHost<'h> {
    fn new(handler: &'h mut dyn CallbackHandler) -> Self {
        Self {
            handler,
            failure: None,
            last_candidate: None,
        }
    }
}

impl Host for CallbackHost<'_> {
    fn clear(&mut self) -> Result<()> {
        Err(anyhow!("Clear; is not available while an engine is running"))
    }

    fn build(&mut self, _script: &str) -> Result<()> {
        Err(anyhow!("Build; is not available while an engine is running"))
    }

    fn update(&mut self, _script: &str) -> Result<()> {
        Err(anyhow!("Update; is not available while an engine is running"))
    }

    fn run(&mut self) -> Result<()> {
        Err(anyhow!("Run; is not available while an engine is running"))
    }

    fn callback(&mut self, payload: &str) -> Result<String> {
        match self.handler.execute_callback(payload) {
            Ok(results) => {
                self.last_candidate = Some(payload.to_string());
                Ok(results)
            }
            Err(err) => {
                let message = err.to_string();
                self.failure = Some(err);
                Err(anyhow!(message))
            }
        }
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn callback_status(&self) -> CallbackStatus {
        self.handler.status()
    }

    /// A callback is always registered during an engine run, so this is
    /// empty rather than absent before the first evaluation.
    fn callback_results(&self) -> Option<String> {
        Some(self.handler.last_results().unwrap_or_default().to_string())
    }

    fn query(&self, name: &str) -> Option<f64> {
        self.handler.query(name)
    }
}

/// Engine process launched per run.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    request_timeout: Duration,
    output_limit_bytes: usize,
}

impl ProcessEngine {
    pub fn new(
        command: &[String],
        request_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("engine command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            request_timeout,
            output_limit_bytes,
        })
    }

    #[instrument(skip_all, fields(program = %self.program))]
    fn run_process(
        &self,
        problem: &Problem,
        handler: &mut dyn CallbackHandler,
    ) -> Result<EngineVerdict, ControlError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning engine process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn engine");
                return Err(anyhow::Error::new(e)
                    .context(format!("spawn engine {}", self.program))
                    .into());
            }
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let limit = self.output_limit_bytes;
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));
        let (tx, requests) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let problem_json = serde_json::to_string(problem).context("serialize problem")?;
        writeln!(stdin, "Problem {problem_json}").context("write problem")?;
        stdin.flush().context("flush problem")?;

        let mut channel = Channel::new(CallbackHost::new(handler));
        let served = self.serve_requests(&mut child, &mut stdin, &requests, &mut channel);
        let host = channel.into_host();
        if let Err(err) = served {
            kill_quietly(&mut child);
            return Err(err);
        }
        drop(stdin);

        let status = self.wait_for_exit(&mut child)?;
        let (stderr, stderr_truncated) = match stderr_handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("stderr reader thread panicked").into()),
        };
        if stderr_truncated > 0 {
            warn!(stderr_truncated, "engine stderr truncated");
        }

        let best = host
            .last_candidate
            .as_deref()
            .map(|payload| parse_payload(payload, problem.variables.len()))
            .transpose()?;
        let text = String::from_utf8_lossy(&stderr).trim().to_string();
        let message = if text.is_empty() {
            Some(format!("engine exited with {status}"))
        } else {
            Some(text)
        };
        info!(exit_code = ?status.code(), "engine finished");
        Ok(EngineVerdict {
            converged: status.success(),
            best,
            message,
        })
    }

    fn serve_requests(
        &self,
        child: &mut Child,
        stdin: &mut ChildStdin,
        requests: &Receiver<std::io::Result<String>>,
        channel: &mut Channel<CallbackHost<'_>>,
    ) -> Result<(), ControlError> {
        loop {
            let line = match requests.recv_timeout(self.request_timeout) {
                Ok(line) => line.context("read engine request")?,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_secs = self.request_timeout.as_secs(),
                        "engine request timed out, killing"
                    );
                    kill_quietly(child);
                    return Err(anyhow!(
                        "engine sent nothing for {}s",
                        self.request_timeout.as_secs()
                    )
                    .into());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = channel.handle_line(&line);
            if let Some(err) = channel.host_mut().failure.take() {
                return Err(err);
            }
            writeln!(stdin, "{reply}").context("write engine reply")?;
            stdin.flush().context("flush engine reply")?;
        }
    }

    fn wait_for_exit(&self, child: &mut Child) -> Result<ExitStatus, ControlError> {
        match child
            .wait_timeout(self.request_timeout)
            .context("wait for engine")?
        {
            Some(status) => Ok(status),
            None => {
                warn!(
                    timeout_secs = self.request_timeout.as_secs(),
                    "engine did not exit, killing"
                );
                child.kill().context("kill engine")?;
                child.wait().context("wait engine after kill")?;
                Err(anyhow!("engine closed its output but did not exit").into())
            }
        }
    }
}

impl ExternalEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn run(
        &mut self,
        problem: &Problem,
        handler: &mut dyn CallbackHandler,
    ) -> Result<EngineVerdict, ControlError> {
        self.run_process(problem, handler)
    }
}

/// Builds a [`ProcessEngine`] per `ExternalOptimizer`, using the solver's
/// `Command`/`RequestTimeout` fields over the configured defaults.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    config: EngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(
        &self,
        solver: &str,
        settings: &ExternalSettings,
    ) -> Result<Box<dyn ExternalEngine>, ControlError> {
        let command: Vec<String> = match &settings.command {
            Some(command) => command.split_whitespace().map(str::to_string).collect(),
            None => self.config.command.clone(),
        };
        let timeout = Duration::from_secs(
            settings
                .request_timeout_secs
                .unwrap_or(self.config.request_timeout_secs),
        );
        let engine = ProcessEngine::new(&command, timeout, self.config.output_limit_bytes)
            .with_context(|| format!("engine for solver '{solver}'"))?;
        debug!(solver, program = %engine.program, "engine configured");
        Ok(Box::new(engine))
    }
}

fn kill_quietly(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(err = %e, "engine already exited");
    }
    if let Err(e) = child.wait() {
        warn!(err = %e, "failed to reap engine");
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
