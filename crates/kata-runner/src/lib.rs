//! Runs untrusted kata scripts in short-lived, resource-limited containers.
//!
//! Each kata owns a docker volume. Each avatar owns a dir in it. Every
//! operation creates one container bound to the volume, works inside it with
//! `docker exec`, and removes it again.

pub mod colour;
pub mod config;
pub mod docker;
pub mod error;
pub mod identity;
pub mod limits;
pub mod output;
pub mod reaper;
pub mod runner;
pub mod shell;
pub mod testing;
pub mod timeout;
pub mod transfer;

pub use colour::{Classifier, Colour, ExitStatusClassifier, PatternClassifier};
pub use config::RunnerConfig;
pub use docker::{ContainerStore, Docker, ImageStore, VolumeStore};
pub use error::{Field, Reason, Result, RunnerError, ValidationError};
pub use runner::{RunFiles, RunResult, Runner};
pub use shell::{CommandLine, HostShell, Shell};
pub use timeout::{TimedOutput, TIMED_OUT_STATUS};
pub use transfer::Files;

pub const REPORT_SCHEMA_VERSION: &str = "kata-runner.report@0.1.0";
