//! A [`Shell`] that replays scripted replies instead of running anything.
//!
//! Expectations are consumed in order. Commands are compared as argv, so an
//! expectation may be written with whatever POSIX quoting reads best.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;
use crate::shell::{CommandLine, ExecOutput, LogMode, Shell};
use crate::timeout::TimedOutput;

#[derive(Debug)]
enum Reply {
    Exec(ExecOutput),
    Timeout(TimedOutput),
}

#[derive(Debug)]
struct Expectation {
    argv: Vec<String>,
    rendered: String,
    reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub command: String,
    pub stdin: Vec<u8>,
}

/// Panics on an unexpected command, and on drop if expectations remain
/// (unless the thread is already panicking).
#[derive(Debug, Default)]
pub struct ScriptedShell {
    expected: Mutex<VecDeque<Expectation>>,
    stdins: Mutex<Vec<Received>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn argv_of(cmd: &CommandLine) -> Vec<String> {
    std::iter::once(cmd.program().to_string())
        .chain(cmd.get_args().iter().cloned())
        .collect()
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, command: &str, reply: Reply) {
        let argv = match shell_words::split(command) {
            Ok(argv) => argv,
            Err(e) => panic!("unparseable expectation {command:?}: {e}"),
        };
        lock(&self.expected).push_back(Expectation {
            argv,
            rendered: command.to_string(),
            reply,
        });
    }

    pub fn mock_exec(&self, command: &str, stdout: &str, stderr: &str, status: i32) {
        self.push(
            command,
            Reply::Exec(ExecOutput::new(stdout, stderr, status)),
        );
    }

    pub fn mock_exec_timeout(&self, command: &str, reply: TimedOutput) {
        self.push(command, Reply::Timeout(reply));
    }

    /// Stdin payloads received so far, in order.
    pub fn stdins(&self) -> Vec<Received> {
        lock(&self.stdins).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.expected).len()
    }

    fn next(&self, cmd: &CommandLine, stdin: Option<&[u8]>) -> Reply {
        let argv = argv_of(cmd);
        let Some(expected) = lock(&self.expected).pop_front() else {
            panic!("unexpected command (none scripted): {cmd}");
        };
        if expected.argv != argv {
            panic!(
                "command mismatch\nexpected: {}\n  actual: {cmd}",
                expected.rendered
            );
        }
        if let Some(bytes) = stdin {
            lock(&self.stdins).push(Received {
                command: cmd.to_string(),
                stdin: bytes.to_vec(),
            });
        }
        expected.reply
    }
}

impl Shell for ScriptedShell {
    fn exec(&self, cmd: &CommandLine, stdin: Option<&[u8]>, _log: LogMode) -> Result<ExecOutput> {
        match self.next(cmd, stdin) {
            Reply::Exec(out) => Ok(out),
            Reply::Timeout(_) => panic!("{cmd} was scripted for exec_timeout, got exec"),
        }
    }

    fn exec_timeout(
        &self,
        cmd: &CommandLine,
        stdin: Option<Vec<u8>>,
        _max: Duration,
    ) -> Result<TimedOutput> {
        match self.next(cmd, stdin.as_deref()) {
            Reply::Timeout(out) => Ok(out),
            Reply::Exec(out) => Ok(TimedOutput::completed(out.stdout, out.stderr, out.status)),
        }
    }
}

impl Drop for ScriptedShell {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let left = lock(&self.expected);
        if let Some(first) = left.front() {
            panic!(
                "{} scripted command(s) never issued; first: {}",
                left.len(),
                first.rendered
            );
        }
    }
}
