use crate::error::{Result, RunnerError};
use crate::identity::{sandbox_path, GID, GROUP};
use crate::output::DEFAULT_MAX_OUTPUT;

pub const ENV_DOCKER_BIN: &str = "KATA_RUNNER_DOCKER_BIN";
pub const ENV_NAME_PREFIX: &str = "KATA_RUNNER_NAME_PREFIX";
pub const ENV_MAX_OUTPUT_BYTES: &str = "KATA_RUNNER_MAX_OUTPUT_BYTES";

pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_NAME_PREFIX: &str = "kata_runner";
pub const SANDBOXES_ROOT: &str = "/sandboxes";
pub const SHARED_DIR_NAME: &str = "shared";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub docker_bin: String,
    pub name_prefix: String,
    pub sandboxes_root: String,
    pub max_output: usize,
    pub group: String,
    pub gid: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            sandboxes_root: SANDBOXES_ROOT.to_string(),
            max_output: DEFAULT_MAX_OUTPUT,
            group: GROUP.to_string(),
            gid: GID,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(bin) = lookup(ENV_DOCKER_BIN) {
            let bin = bin.trim();
            if bin.is_empty() {
                return Err(RunnerError::Config(format!("{ENV_DOCKER_BIN} is empty")));
            }
            cfg.docker_bin = bin.to_string();
        }
        if let Some(prefix) = lookup(ENV_NAME_PREFIX) {
            cfg = cfg.with_name_prefix(prefix.trim())?;
        }
        if let Some(raw) = lookup(ENV_MAX_OUTPUT_BYTES) {
            cfg.max_output = raw.trim().parse::<usize>().map_err(|e| {
                RunnerError::Config(format!("invalid {ENV_MAX_OUTPUT_BYTES}={raw:?}: {e}"))
            })?;
        }
        Ok(cfg)
    }

    pub fn with_name_prefix(mut self, prefix: &str) -> Result<Self> {
        validate_name_prefix(prefix).map_err(RunnerError::Config)?;
        self.name_prefix = prefix.to_string();
        Ok(self)
    }

    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn volume_name(&self, kata_id: &str) -> String {
        format!("{}_{kata_id}", self.name_prefix)
    }

    pub fn container_name(&self, kata_id: &str, avatar_name: &str) -> String {
        format!("{}_{kata_id}_{avatar_name}", self.name_prefix)
    }

    pub fn sandbox_path(&self, avatar_name: &str) -> String {
        sandbox_path(&self.sandboxes_root, avatar_name)
    }

    pub fn shared_path(&self) -> String {
        sandbox_path(&self.sandboxes_root, SHARED_DIR_NAME)
    }
}

/// Docker object names are `[A-Za-z0-9][A-Za-z0-9_.-]*`; the prefix leaves
/// room for the kata id and avatar name.
pub fn validate_name_prefix(prefix: &str) -> std::result::Result<(), String> {
    if prefix.is_empty() {
        return Err("name prefix is empty".to_string());
    }
    if prefix.len() > 64 {
        return Err("name prefix must be <= 64 bytes".to_string());
    }
    let first = prefix.as_bytes()[0] as char;
    if !first.is_ascii_alphanumeric() {
        return Err("name prefix must start with [A-Za-z0-9]".to_string());
    }
    for c in prefix.chars() {
        if !matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' | '-') {
            return Err(format!("name prefix contains invalid character {c:?}"));
        }
    }
    Ok(())
}
