//! Wall-clock bounded execution of a host command.
//!
//! The command is spawned as the leader of a new process group. If it has not
//! exited, and its stdout/stderr have not reached EOF, by the deadline, the
//! whole group is sent SIGKILL and the leader is handed to [`crate::reaper`].
//!
//! For `docker exec` this only stops the host-side client. Whatever it started
//! inside the container keeps running until the container itself is removed,
//! so callers must always tear the container down after a timeout.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Field, Result, RunnerError, ValidationError};
use crate::output::{capture_cap, cleaned, read_to_end_capped, truncated};
use crate::reaper;
use crate::shell::{exit_status_code, CommandLine};

/// Reported in place of an exit status when the deadline expired (128 + SIGKILL).
pub const TIMED_OUT_STATUS: i32 = 137;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    pub timed_out: bool,
}

impl TimedOutput {
    pub fn completed(stdout: impl Into<String>, stderr: impl Into<String>, status: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            status: TIMED_OUT_STATUS,
            timed_out: true,
        }
    }
}

type Captured = io::Result<(Vec<u8>, bool)>;

pub fn run_timeout(
    cmd: &CommandLine,
    stdin: Option<Vec<u8>>,
    max: Duration,
    max_output: usize,
) -> Result<TimedOutput> {
    let deadline = Instant::now()
        .checked_add(max)
        .ok_or_else(|| ValidationError::invalid(Field::MaxSeconds))?;

    let mut command = cmd.to_command();
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
        command: cmd.to_string(),
        source,
    })?;
    let pid = child.id();

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        thread::spawn(move || {
            use std::io::Write as _;
            let _ = pipe.write_all(&bytes);
        });
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        hard_kill_pid_and_group(pid);
        reaper::register(child);
        return Err(io::Error::new(io::ErrorKind::Other, "child output is not piped").into());
    };

    let cap = capture_cap(max_output);
    let stdout_rx = spawn_capture(stdout, cap);
    let stderr_rx = spawn_capture(stderr, cap);

    let status = match wait_until(&mut child, deadline) {
        Ok(Some(status)) => status,
        Ok(None) => return Ok(expire(cmd, pid, Some(child), max)),
        Err(e) => {
            hard_kill_pid_and_group(pid);
            reaper::register(child);
            return Err(e.into());
        }
    };

    // Descendants left in the group can hold the pipes open past the leader's
    // exit; the deadline covers draining them too.
    let Some(stdout) = recv_until(&stdout_rx, deadline) else {
        return Ok(expire(cmd, pid, None, max));
    };
    let Some(stderr) = recv_until(&stderr_rx, deadline) else {
        return Ok(expire(cmd, pid, None, max));
    };
    let (stdout, _) = stdout?;
    let (stderr, _) = stderr?;

    Ok(TimedOutput::completed(
        truncated(cleaned(&stdout), max_output),
        truncated(cleaned(&stderr), max_output),
        exit_status_code(status),
    ))
}

fn spawn_capture<R>(reader: R, cap: usize) -> mpsc::Receiver<Captured>
where
    R: io::Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_to_end_capped(reader, cap));
    });
    rx
}

fn wait_until(
    child: &mut std::process::Child,
    deadline: Instant,
) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn recv_until(rx: &mpsc::Receiver<Captured>, deadline: Instant) -> Option<Captured> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(captured) => Some(captured),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Some(Err(io::Error::new(io::ErrorKind::Other, "output reader exited")))
        }
    }
}

fn expire(
    cmd: &CommandLine,
    pid: u32,
    child: Option<std::process::Child>,
    max: Duration,
) -> TimedOutput {
    tracing::info!(
        command = %cmd,
        pid,
        max_ms = max.as_millis() as u64,
        "deadline expired; killing process group"
    );
    match child {
        Some(child) => {
            hard_kill_pid_and_group(pid);
            reaper::register(child);
        }
        // The leader is already reaped and its pid may be reused; only the
        // group it left behind is still ours.
        None => kill_group(pid),
    }
    TimedOutput::timed_out()
}

/// SIGKILL to the process group led by `pid`, then to `pid` itself. Only
/// valid while `pid` is an unreaped child.
pub fn hard_kill_pid_and_group(pid: u32) {
    kill_group(pid);
    signal(pid, false);
}

/// SIGKILL to the process group `pid` once led.
fn kill_group(pid: u32) {
    signal(pid, true);
}

fn signal(pid: u32, group: bool) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        let target = if group { -pid } else { pid };
        unsafe {
            let _ = libc::kill(target, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, group);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").args(["-c", script])
    }

    #[test]
    fn completes_within_deadline() {
        let out = run_timeout(&sh("echo hello; exit 4"), None, Duration::from_secs(5), 1024)
            .unwrap();
        assert_eq!(out, TimedOutput::completed("hello\n", "", 4));
    }

    #[test]
    fn stdin_reaches_the_child() {
        let out = run_timeout(
            &CommandLine::new("cat"),
            Some(b"abc".to_vec()),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        assert_eq!(out.stdout, "abc");
        assert!(!out.timed_out);
    }

    #[test]
    fn expiry_kills_and_reports_sentinel() {
        let start = Instant::now();
        let out = run_timeout(&sh("echo early; sleep 30"), None, Duration::from_millis(300), 1024)
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(out, TimedOutput::timed_out());
        assert_eq!(out.status, TIMED_OUT_STATUS);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn kill_group_leaves_a_bare_pid_alone() {
        // Not a group leader, so no group carries its pid.
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        kill_group(child.id());
        thread::sleep(Duration::from_millis(100));
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn output_is_truncated() {
        let out = run_timeout(
            &sh("i=0; while [ $i -lt 100 ]; do printf 0123456789; i=$((i+1)); done"),
            None,
            Duration::from_secs(5),
            25,
        )
        .unwrap();
        assert_eq!(out.stdout, "0123456789012345678901234");
    }
}
