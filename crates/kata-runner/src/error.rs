use std::fmt;

/// The argument a [`ValidationError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    KataId,
    AvatarName,
    ImageName,
    Filename,
    MaxSeconds,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::KataId => "kata_id",
            Field::AvatarName => "avatar_name",
            Field::ImageName => "image_name",
            Field::Filename => "filename",
            Field::MaxSeconds => "max_seconds",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Invalid,
    Exists,
    NotExists,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Invalid => "invalid",
            Reason::Exists => "exists",
            Reason::NotExists => "!exists",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected argument. Raised before any volume or container is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{field}:{reason}")]
pub struct ValidationError {
    pub field: Field,
    pub reason: Reason,
}

impl ValidationError {
    pub fn new(field: Field, reason: Reason) -> Self {
        Self { field, reason }
    }

    pub fn invalid(field: Field) -> Self {
        Self::new(field, Reason::Invalid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("command:{command}")]
    Command {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            RunnerError::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_command_failure(&self) -> bool {
        matches!(self, RunnerError::Command { .. })
    }
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
