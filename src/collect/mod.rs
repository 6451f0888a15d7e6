//! Raw inputs for the loggers: command output, metrics samples, boot time
//! and the base directory on removable storage.

pub mod mount;

use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EventCommand;

/// Supplies the captured text of one command invocation.
pub trait CommandOutputSource: Send + Sync {
    /// Captured output; failures are reported as an empty capture.
    fn capture(&self, cmd: &EventCommand) -> String;
}

/// Runs each command through `sh -c`, folding stderr into the text.
#[derive(Debug, Default, Clone)]
pub struct ShellOutputSource;

impl CommandOutputSource for ShellOutputSource {
    fn capture(&self, cmd: &EventCommand) -> String {
        match run_shell(&cmd.command) {
            Ok(output) if output.status.success() => combined_text(&output),
            Ok(output) => {
                warn!(
                    name = %cmd.name,
                    status = %output.status,
                    "event command failed, treating as empty capture"
                );
                String::new()
            }
            Err(e) => {
                warn!(name = %cmd.name, error = %e, "event command could not be started");
                String::new()
            }
        }
    }
}

fn run_shell(command: &str) -> io::Result<Output> {
    Command::new("sh").arg("-c").arg(command).output()
}

fn combined_text(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    text
}

/// Event stream that mirrors the integrity probe's error log.
pub const ERROR_LOG_STREAM: &str = "writetest_errors";

/// Table entry for the error log stream; the command text only labels
/// the segment header.
pub fn error_log_command(path: &Path) -> EventCommand {
    EventCommand::new(ERROR_LOG_STREAM, format!("cat {}", path.display()))
}

/// Reads the error log for [`ERROR_LOG_STREAM`] and defers every other
/// stream to `inner`.
pub struct WithErrorLog<'a> {
    inner: &'a dyn CommandOutputSource,
    path: &'a Path,
}

impl<'a> WithErrorLog<'a> {
    pub fn new(inner: &'a dyn CommandOutputSource, path: &'a Path) -> Self {
        Self { inner, path }
    }
}

impl CommandOutputSource for WithErrorLog<'_> {
    fn capture(&self, cmd: &EventCommand) -> String {
        if cmd.name != ERROR_LOG_STREAM {
            return self.inner.capture(cmd);
        }

        match fs::read(self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "reading error log");
                String::new()
            }
        }
    }
}

/// Supplies the dynamic metric columns for one cycle, in a stable order.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> Result<Vec<(String, String)>>;
}

/// No dynamic columns.
#[derive(Debug, Default, Clone)]
pub struct NoMetrics;

impl MetricsSource for NoMetrics {
    fn sample(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Runs a script printing `name,value` lines.
#[derive(Debug, Clone)]
pub struct ScriptMetricsSource {
    command: String,
}

impl ScriptMetricsSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl MetricsSource for ScriptMetricsSource {
    fn sample(&self) -> Result<Vec<(String, String)>> {
        let output = run_shell(&self.command)
            .with_context(|| format!("running metrics command {:?}", self.command))?;

        if !output.status.success() {
            bail!(
                "metrics command {:?} exited with {}",
                self.command,
                output.status
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let columns = parse_metrics(&text)?;
        debug!(columns = columns.len(), "sampled raw metrics");

        Ok(columns)
    }
}

/// Errors in raw metrics text.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetricsParseError {
    #[error("line {line}: expected `name,value`")]
    MissingValue { line: usize },

    #[error("line {line}: empty metric name")]
    EmptyName { line: usize },
}

/// Parse `name,value` lines. All whitespace is removed first; blank lines
/// are skipped; anything after the second comma stays part of the value.
pub fn parse_metrics(text: &str) -> Result<Vec<(String, String)>, MetricsParseError> {
    let mut columns = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if line.is_empty() {
            continue;
        }

        let (name, value) = line
            .split_once(',')
            .ok_or(MetricsParseError::MissingValue { line: idx + 1 })?;

        if name.is_empty() {
            return Err(MetricsParseError::EmptyName { line: idx + 1 });
        }

        columns.push((name.to_string(), value.to_string()));
    }

    Ok(columns)
}

/// Host boot time in seconds since the Unix epoch, from `/proc/stat`.
pub fn boot_time_unix() -> Option<i64> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    parse_btime(&stat)
}

fn parse_btime(stat: &str) -> Option<i64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse::<i64>().ok())
}
