//! Verb channel: the line-oriented request/response surface above the bridge.
//!
//! Executes are verbs (`Build;`, `Run;`, `Callback;`, ...) or script text,
//! which is buffered until the next `Build;`/`Update;`. Queries read run state,
//! callback state and object values. On the line transport a request starting
//! with `?` is a query; every request gets exactly one reply line.

use std::fmt;
use std::io::{BufRead, Write};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument};

use crate::bridge::CallbackStatus;

/// Reply to a parameter query whose name cannot be resolved.
pub const UNKNOWN_VALUE: &str = "-123456789.123456789";

/// Reply to `CallbackResults` when no callback is registered.
pub const NO_CALLBACK: &str = "ERROR!!";

/// Byte offset of the payload in a `CallbackData` request.
const CALLBACK_DATA_OFFSET: usize = "CallbackData".len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb<'a> {
    Open,
    Clear,
    Build,
    Update,
    Run,
    BuildRun,
    Callback,
    CallbackData(&'a str),
    /// Anything else: a line of script to buffer.
    Script(&'a str),
}

pub fn parse_verb(line: &str) -> Verb<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    let command = line.trim_start();
    match line.trim() {
        "Open;" => Verb::Open,
        "Clear;" => Verb::Clear,
        "Build;" => Verb::Build,
        "Update;" => Verb::Update,
        "Run;" => Verb::Run,
        "Build+Run;" => Verb::BuildRun,
        "Callback;" => Verb::Callback,
        _ if command.starts_with("CallbackData") => {
            Verb::CallbackData(command.get(CALLBACK_DATA_OFFSET..).unwrap_or(""))
        }
        _ => Verb::Script(line),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Idle,
    Unknown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Running => "Running",
            RunState::Paused => "Paused",
            RunState::Idle => "Idle",
            RunState::Unknown => "Unknown",
        })
    }
}

/// The side of the channel that acts on verbs.
pub trait Host {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()>;

    /// Replace the whole configuration and mission with `script`.
    fn build(&mut self, script: &str) -> Result<()>;

    /// Replace object definitions only.
    fn update(&mut self, script: &str) -> Result<()>;

    fn run(&mut self) -> Result<()>;

    /// Evaluate one callback; returns the results text.
    fn callback(&mut self, payload: &str) -> Result<String>;

    fn run_state(&self) -> RunState;

    fn callback_status(&self) -> CallbackStatus;

    /// Results of the last callback, `None` when no callback is registered.
    fn callback_results(&self) -> Option<String>;

    fn query(&self, name: &str) -> Option<f64>;
}

#[derive(Debug)]
pub struct Channel<H> {
    host: H,
    script: String,
    callback_data: Option<String>,
}

impl<H: Host> Channel<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            script: String::new(),
            callback_data: None,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// Script text buffered since the last build.
    pub fn buffered(&self) -> &str {
        &self.script
    }

    #[instrument(skip_all)]
    pub fn execute(&mut self, line: &str) -> Result<()> {
        let verb = parse_verb(line);
        debug!(?verb, "execute");
        match verb {
            Verb::Open => self.host.open(),
            Verb::Clear => {
                self.script.clear();
                self.callback_data = None;
                self.host.clear()
            }
            Verb::Build => {
                let script = std::mem::take(&mut self.script);
                self.host.build(&script)
            }
            Verb::Update => {
                let script = std::mem::take(&mut self.script);
                self.host.update(&script)
            }
            Verb::Run => self.host.run(),
            Verb::BuildRun => {
                let script = std::mem::take(&mut self.script);
                self.host.build(&script)?;
                self.host.run()
            }
            Verb::Callback => {
                let payload = self
                    .callback_data
                    .as_deref()
                    .ok_or_else(|| anyhow!("Callback; received before any CallbackData"))?;
                self.host.callback(payload).map(|_| ())
            }
            Verb::CallbackData(payload) => {
                self.callback_data = Some(payload.to_string());
                Ok(())
            }
            Verb::Script(text) => {
                self.script.push_str(text);
                self.script.push('\n');
                Ok(())
            }
        }
    }

    pub fn request(&self, item: &str) -> String {
        match item.trim() {
            "RunState" => self.host.run_state().to_string(),
            "CallbackStatus" => self.host.callback_status().to_string(),
            "CallbackResults" => self
                .host
                .callback_results()
                .unwrap_or_else(|| NO_CALLBACK.to_string()),
            name => self
                .host
                .query(name)
                .map_or_else(|| UNKNOWN_VALUE.to_string(), |value| format!("[{value}]")),
        }
    }

    /// Handle one line of the line transport and return the reply line.
    pub fn handle_line(&mut self, line: &str) -> String {
        if let Some(item) = line.strip_prefix('?') {
            return self.request(item);
        }
        match self.execute(line) {
            Ok(()) => "OK".to_string(),
            Err(err) => {
                error!(err = %err, "verb failed");
                format!("ERROR: {err:#}")
            }
        }
    }
}

/// Serve requests from `reader` until EOF, replying on `writer`.
pub fn serve<H: Host, R: BufRead, W: Write>(
    channel: &mut Channel<H>,
    reader: R,
    mut writer: W,
) -> Result<()> {
    for line in reader.lines() {
        let line = line.context("read request")?;
        let reply = channel.handle_line(&line);
        writeln!(writer, "{reply}").context("write reply")?;
        writer.flush().context("flush reply")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_recognized_exactly() {
        assert_eq!(parse_verb("Build+Run;"), Verb::BuildRun);
        assert_eq!(parse_verb("Callback;\r\n"), Verb::Callback);
        assert_eq!(
            parse_verb("CallbackData 1.5 2"),
            Verb::CallbackData(" 1.5 2")
        );
        assert_eq!(parse_verb("  CallbackData 1.5"), Verb::CallbackData(" 1.5"));
        assert_eq!(parse_verb("Run"), Verb::Script("Run"));
        assert_eq!(
            parse_verb("Create Variable v"),
            Verb::Script("Create Variable v")
        );
    }
}
