//! External command execution with deadlines and cancellation.
//!
//! Every target that shells out (git, rsync, ssh, aws) and the site builder go
//! through [`CommandRunner`], so tests can swap in a scripted runner and
//! assert on exactly which commands were issued.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deadline for long transfers unless a target configures its own
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Deadline for `--version` style presence probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },
}

impl ProcessError {
    /// True when the program itself could not be found
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// A single command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment; used for credentials so they never show up in argv
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Keep only the last N lines of each stream; `None` keeps everything
    pub output_limit: Option<usize>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            output_limit: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound memory for chatty commands whose useful output comes last
    pub fn keep_last_lines(mut self, lines: usize) -> Self {
        self.output_limit = Some(lines);
        self
    }

    /// Program and arguments, for logs. Environment is deliberately left out.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Lines discarded by [`CommandSpec::keep_last_lines`], both streams
    pub dropped_lines: usize,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            dropped_lines: 0,
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            dropped_lines: 0,
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, _) => self.stderr.clone(),
        }
    }

    /// Last `lines` lines of the combined output
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ProcessError>;

    /// Whether `program` is installed, judged by a version probe
    async fn probe(&self, program: &str, version_args: &[&str], cancel: &CancellationToken) -> bool {
        let spec = CommandSpec::new(program)
            .args(version_args.iter().copied())
            .timeout(PROBE_TIMEOUT);
        matches!(self.run(&spec, cancel).await, Ok(output) if output.success)
    }
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ProcessError> {
        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "Running command");

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let spawn_error = |source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        };
        let execute = async {
            let mut child = cmd.spawn().map_err(spawn_error)?;
            let (stdout, stderr, status) = tokio::join!(
                capture(child.stdout.take(), spec.output_limit),
                capture(child.stderr.take(), spec.output_limit),
                child.wait(),
            );
            let status = status.map_err(spawn_error)?;
            Ok::<_, ProcessError>(CommandOutput {
                success: status.success(),
                code: status.code().unwrap_or(-1),
                stdout: stdout.text,
                stderr: stderr.text,
                dropped_lines: stdout.dropped + stderr.dropped,
            })
        };

        // Dropping the future drops the child, which kills it
        tokio::select! {
            result = tokio::time::timeout(spec.timeout, execute) => match result {
                Ok(output) => output,
                Err(_) => Err(ProcessError::TimedOut {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                }),
            },
            _ = cancel.cancelled() => Err(ProcessError::Cancelled {
                program: spec.program.clone(),
            }),
        }
    }
}

struct Captured {
    text: String,
    dropped: usize,
}

/// Drain a child stream line by line, keeping at most `limit` trailing lines
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>, limit: Option<usize>) -> Captured {
    let mut kept = VecDeque::new();
    let mut dropped = 0;
    if let Some(stream) = stream {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if let Some(limit) = limit
                && kept.len() >= limit.max(1)
            {
                kept.pop_front();
                dropped += 1;
            }
            let line = String::from_utf8_lossy(&buf);
            kept.push_back(line.trim_end_matches(['\n', '\r']).to_string());
        }
    }
    let text = Vec::from(kept).join("\n").trim().to_string();
    Captured { text, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_lines() {
        let stdout = (1..=30).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let output = CommandOutput {
            success: false,
            code: 23,
            stdout,
            stderr: "rsync error: some files could not be transferred".to_string(),
            ..Default::default()
        };
        let tail = output.tail(20);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("could not be transferred"));
    }

    #[test]
    fn test_combined_skips_empty_streams() {
        assert_eq!(CommandOutput::ok("out").combined(), "out");
        assert_eq!(CommandOutput::failed(1, "err").combined(), "err");
    }

    #[test]
    fn test_display_omits_env() {
        let spec = CommandSpec::new("aws")
            .args(["s3", "sync"])
            .env("AWS_SECRET_ACCESS_KEY", "hunter2");
        assert_eq!(spec.display(), "aws s3 sync");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sitedeploy-definitely-not-installed");
        let err = runner.run(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!runner.probe("sitedeploy-definitely-not-installed", &["--version"], &CancellationToken::new()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_real_process() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = runner.run(&spec, &CancellationToken::new()).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_limit_keeps_tail() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sh")
            .args(["-c", "seq 1 5000; echo 'Total transferred file size: 42'"])
            .keep_last_lines(3);
        let output = runner.run(&spec, &CancellationToken::new()).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "4999\n5000\nTotal transferred file size: 42");
        assert_eq!(output.dropped_lines, 4998);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_reported() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let err = runner.run(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let runner = ProcessRunner;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = CommandSpec::new("sleep").arg("5");
        let err = runner.run(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }
}
