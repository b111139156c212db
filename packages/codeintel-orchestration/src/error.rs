use codeintel_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Failure reported by an external collaborator (git, blob store, registry)
    #[error("{operation}: {message}")]
    Collaborator { operation: String, message: String },

    /// An error annotated with the call site that produced it
    #[error("{operation}: {source}")]
    Wrapped {
        operation: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("repository {0} not found")]
    RepositoryNotFound(i64),

    #[error("commit does not exist")]
    CommitDoesNotExist,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    Join(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl OrchestratorError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn collaborator<E: std::fmt::Display>(operation: impl Into<String>, e: E) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            message: e.to_string(),
        }
    }

    /// Prefix the error with the operation that failed
    pub fn wrap(self, operation: impl Into<String>) -> Self {
        Self::Wrapped {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, with call-site wrappers removed
    pub fn root(&self) -> &OrchestratorError {
        match self {
            Self::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.root(), Self::Storage(e) if e.is_unique_violation())
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Self::Cancelled => ErrorCategory::Transient,
            Self::Parse(_)
            | Self::RepositoryNotFound(_)
            | Self::CommitDoesNotExist
            | Self::InvalidPhaseTransition { .. }
            | Self::Config(_) => ErrorCategory::Permanent,
            Self::Storage(_)
            | Self::Collaborator { .. }
            | Self::Io(_)
            | Self::Join(_)
            | Self::Metrics(_)
            | Self::Wrapped { .. } => ErrorCategory::Infrastructure,
        }
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

/// Extension for annotating results with the failing call site
pub trait ResultExt<T> {
    fn wrap_err(self, operation: &str) -> Result<T>;
}

impl<T, E: Into<OrchestratorError>> ResultExt<T> for std::result::Result<T, E> {
    fn wrap_err(self, operation: &str) -> Result<T> {
        self.map_err(|e| e.into().wrap(operation))
    }
}

/// Error category, used for logging and failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - the job is retried later without counting a failure
    Transient,
    /// Permanent error - retrying the same input fails the same way
    Permanent,
    /// Infrastructure error - a store or backend misbehaved
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
