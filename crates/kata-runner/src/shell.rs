use std::ffi::OsString;
use std::fmt;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Result, RunnerError};
use crate::output::{cleaned, DEFAULT_MAX_OUTPUT};
use crate::timeout::{run_timeout, TimedOutput};

/// An argv. Never passed through a host shell; [`fmt::Display`] renders it with
/// POSIX quoting for logs, errors and scripted test expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(OsString::from));
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        f.write_str(&shell_words::join(words))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, status: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Whether a non-zero status is worth a diagnostic. Existence probes are
/// expected to fail and run `Quiet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Logged,
    Quiet,
}

pub trait Shell {
    fn exec(&self, cmd: &CommandLine, stdin: Option<&[u8]>, log: LogMode) -> Result<ExecOutput>;

    /// Runs `cmd` as a process-group leader, killing the whole group once
    /// `max` has elapsed.
    fn exec_timeout(
        &self,
        cmd: &CommandLine,
        stdin: Option<Vec<u8>>,
        max: Duration,
    ) -> Result<TimedOutput>;

    /// Like [`Shell::exec`] but a non-zero status is an error carrying the
    /// command, status, stdout and stderr.
    fn assert_exec(&self, cmd: &CommandLine, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let out = self.exec(cmd, stdin, LogMode::Logged)?;
        if out.success() {
            return Ok(out);
        }
        tracing::warn!(
            command = %cmd,
            status = out.status,
            stdout = %out.stdout,
            stderr = %out.stderr,
            "command failed"
        );
        Err(RunnerError::Command {
            command: cmd.to_string(),
            status: out.status,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

impl<S: Shell + ?Sized> Shell for &S {
    fn exec(&self, cmd: &CommandLine, stdin: Option<&[u8]>, log: LogMode) -> Result<ExecOutput> {
        (**self).exec(cmd, stdin, log)
    }

    fn exec_timeout(
        &self,
        cmd: &CommandLine,
        stdin: Option<Vec<u8>>,
        max: Duration,
    ) -> Result<TimedOutput> {
        (**self).exec_timeout(cmd, stdin, max)
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Clone)]
pub struct HostShell {
    max_output: usize,
}

impl HostShell {
    pub fn new(max_output: usize) -> Self {
        Self { max_output }
    }
}

impl Default for HostShell {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT)
    }
}

impl Shell for HostShell {
    fn exec(&self, cmd: &CommandLine, stdin: Option<&[u8]>, log: LogMode) -> Result<ExecOutput> {
        match log {
            LogMode::Logged => tracing::debug!(command = %cmd, "exec"),
            LogMode::Quiet => tracing::trace!(command = %cmd, "exec"),
        }

        let mut command = cmd.to_command();
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let spawn_err = |source| RunnerError::Spawn {
            command: cmd.to_string(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_err)?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(std::thread::spawn(move || {
                    // A reader that exits early closes the pipe; that is its
                    // status to report, not ours.
                    let _ = pipe.write_all(&bytes);
                }))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        let status = exit_status_code(output.status);
        let out = ExecOutput {
            stdout: cleaned(&output.stdout),
            stderr: cleaned(&output.stderr),
            status,
        };
        if log == LogMode::Quiet {
            tracing::trace!(command = %cmd, status, "exec done");
        } else {
            tracing::debug!(command = %cmd, status, "exec done");
        }
        Ok(out)
    }

    fn exec_timeout(
        &self,
        cmd: &CommandLine,
        stdin: Option<Vec<u8>>,
        max: Duration,
    ) -> Result<TimedOutput> {
        tracing::debug!(command = %cmd, max_ms = max.as_millis() as u64, "exec with deadline");
        run_timeout(cmd, stdin, max, self.max_output)
    }
}

/// Exit code, or `128 + signal` for a signalled process.
pub fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    }
}
