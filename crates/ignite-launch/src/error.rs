use std::path::PathBuf;
use thiserror::Error;

pub type JobResult<T> = std::result::Result<T, JobError>;

/// Everything that can stop a launch attempt before or while the runtime starts.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job config: {0}")]
    Validation(#[from] ValidationError),

    #[error("resource unavailable: {0}")]
    Resource(#[from] ResourceError),

    #[error("cannot use {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start training runtime: {0}")]
    Launch(#[from] LaunchError),
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Bad, missing or conflicting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown option `{name}`")]
    UnknownOption { name: String },

    #[error("unexpected argument `{arg}`: options are written as `--name value`")]
    UnexpectedArgument { arg: String },

    #[error("`{field}` is required")]
    Missing { field: &'static str },

    #[error("`{field}` cannot be `{value}`: {reason}")]
    InvalidValue { field: &'static str, value: String, reason: String },

    #[error("`{field}` {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("{} cannot be combined: {reason}", join_fields(fields))]
    Conflict { fields: Vec<&'static str>, reason: String },
}

impl ValidationError {
    /// Option names this error is about, for callers that want to highlight them.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::UnknownOption { name } => vec![name.as_str()],
            Self::UnexpectedArgument { .. } => Vec::new(),
            Self::Missing { field } | Self::InvalidValue { field, .. } | Self::OutOfRange { field, .. } => {
                vec![*field]
            }
            Self::Conflict { fields, .. } => fields.clone(),
        }
    }
}

fn join_fields(fields: &[&'static str]) -> String {
    fields.iter().map(|f| format!("`{f}`")).collect::<Vec<_>>().join(" and ")
}

/// Host resources the job needs but cannot get.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("master port {port} is already bound on this host")]
    PortInUse { port: u16 },

    #[error("no free master port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    #[error("device {device} is not available (host reports {available} device(s))")]
    DeviceUnavailable { device: u32, available: usize },
}

/// The external runtime could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("runtime `{program}` not found on PATH")]
    NotFound { program: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost track of runtime process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}
