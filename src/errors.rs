use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

pub const EXIT_ARGUMENT_ERROR: u8 = 1;
pub const EXIT_PIPELINE_ERROR: u8 = 2;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing value for argument: {flag}")]
    MissingValue { flag: String },
    #[error("missing required argument: {field}")]
    MissingRequired { field: String },
    #[error("invalid value for {flag}={value}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("unsupported argument: {arg}")]
    UnsupportedArgument { arg: String },
    #[error("argument error: {message}")]
    Cli { message: String },
    #[error("cannot read input {flag}={}: {reason}", path.display())]
    InputUnreadable {
        flag: String,
        path: PathBuf,
        reason: String,
    },
    #[error("output directory {} is in use by another run (lock file {} exists)", root.display(), lock.display())]
    OutputInUse { root: PathBuf, lock: PathBuf },
    #[error("required command not found in PATH: {command}")]
    CommandNotFound { command: String },
    #[error("phase {phase} failed on {target} (exit: {code:?}); see log {}", log.display())]
    ToolFailed {
        phase: String,
        target: String,
        code: Option<i32>,
        log: PathBuf,
    },
    #[error("stage {stage} is missing expected artifact {}", path.display())]
    MissingArtifact { stage: String, path: PathBuf },
    #[error("stage {stage} cannot start before {requires} has committed")]
    StageOrder { stage: String, requires: String },
    #[error("invalid variant record in {source_name} line {line}: {reason}")]
    InvalidRecord {
        source_name: String,
        line: usize,
        reason: String,
    },
    #[error("invalid reference index {}: {reason}", path.display())]
    InvalidIndex { path: PathBuf, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Process exit code: argument problems are reported before any stage
    /// starts, everything else is a pipeline failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::MissingValue { .. }
            | Self::MissingRequired { .. }
            | Self::InvalidValue { .. }
            | Self::UnsupportedArgument { .. }
            | Self::Cli { .. }
            | Self::InputUnreadable { .. }
            | Self::OutputInUse { .. } => EXIT_ARGUMENT_ERROR,
            Self::CommandNotFound { .. }
            | Self::ToolFailed { .. }
            | Self::MissingArtifact { .. }
            | Self::StageOrder { .. }
            | Self::InvalidRecord { .. }
            | Self::InvalidIndex { .. }
            | Self::Io(_) => EXIT_PIPELINE_ERROR,
        }
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Self::ToolFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}
