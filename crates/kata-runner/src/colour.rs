use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Colour {
    Red,
    Amber,
    Green,
    TimedOut,
}

impl Colour {
    pub fn as_str(self) -> &'static str {
        match self {
            Colour::Red => "red",
            Colour::Amber => "amber",
            Colour::Green => "green",
            Colour::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns a completed run into red/amber/green. Compiled in; nothing is read
/// from the image. An `Err` makes the caller fall back to amber.
pub trait Classifier: Send + Sync {
    fn classify(&self, stdout: &str, stderr: &str, status: i32) -> Result<Colour>;
}

/// 0 is green, 1 (a failing test run) is red, anything else is amber.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatusClassifier;

impl Classifier for ExitStatusClassifier {
    fn classify(&self, _stdout: &str, _stderr: &str, status: i32) -> Result<Colour> {
        Ok(match status {
            0 => Colour::Green,
            1 => Colour::Red,
            _ => Colour::Amber,
        })
    }
}

/// Matches test-framework summaries in stdout. Red is checked first.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    red: Regex,
    green: Regex,
}

impl PatternClassifier {
    pub fn new(red: &str, green: &str) -> Result<Self> {
        let compile = |which: &str, pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                RunnerError::Config(format!("{which} colour pattern {pattern:?}: {e}"))
            })
        };
        Ok(Self {
            red: compile("red", red)?,
            green: compile("green", green)?,
        })
    }
}

impl Classifier for PatternClassifier {
    fn classify(&self, stdout: &str, _stderr: &str, _status: i32) -> Result<Colour> {
        if self.red.is_match(stdout) {
            return Ok(Colour::Red);
        }
        if self.green.is_match(stdout) {
            return Ok(Colour::Green);
        }
        Ok(Colour::Amber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_classification() {
        let c = ExitStatusClassifier;
        assert_eq!(c.classify("hello\n", "", 0).unwrap(), Colour::Green);
        assert_eq!(c.classify("", "1 failure", 1).unwrap(), Colour::Red);
        assert_eq!(c.classify("", "syntax error", 2).unwrap(), Colour::Amber);
        assert_eq!(c.classify("", "", 139).unwrap(), Colour::Amber);
    }

    #[test]
    fn pattern_classification() {
        let c = PatternClassifier::new(r"(?m)^\d+ failures?$", r"All tests passed").unwrap();
        assert_eq!(c.classify("3 failures\n", "", 1).unwrap(), Colour::Red);
        assert_eq!(c.classify("All tests passed\n", "", 0).unwrap(), Colour::Green);
        assert_eq!(c.classify("hiker.c:3: error", "", 2).unwrap(), Colour::Amber);
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        assert!(matches!(
            PatternClassifier::new("(", "ok"),
            Err(RunnerError::Config(_))
        ));
    }

    #[test]
    fn colour_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Colour::TimedOut).unwrap(), "\"timed_out\"");
        assert_eq!(Colour::Amber.to_string(), "amber");
    }
}
