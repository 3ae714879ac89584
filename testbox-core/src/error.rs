//! Error Taxonomy
//!
//! Every public operation in the crate returns [`Result`], whose error side is
//! the single [`Error`] enum below.  Callers that only care about the broad
//! class of a failure match on [`Error::kind`] instead of individual variants.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing configuration, including unmet engine dependencies.
    Configuration,
    /// A quota (environments, queue slots) is exhausted.
    CapacityExceeded,
    /// Unknown environment, task, engine or snapshot id.
    NotFound,
    /// The operation is not valid in the current lifecycle state.
    StateConflict,
    /// A backend driver, the package index or the filesystem failed.
    ExternalFailure,
    /// An operation ran past its deadline.
    Timeout,
    /// A dependency graph has no valid topological order.
    CyclicDependency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::CapacityExceeded => write!(f, "capacity-exceeded"),
            Self::NotFound => write!(f, "not-found"),
            Self::StateConflict => write!(f, "state-conflict"),
            Self::ExternalFailure => write!(f, "external-failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::CyclicDependency => write!(f, "cyclic-dependency"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("engine '{0}' is already registered")]
    DuplicateEngine(String),

    #[error("engine '{name}' is invalid: {reason}")]
    InvalidEngine { name: String, reason: String },

    #[error("engine '{engine}' depends on unregistered engine '{dependency}'")]
    UnmetDependency { engine: String, dependency: String },

    #[error("capacity exceeded: {resource} limit of {limit} reached")]
    CapacityExceeded { resource: String, limit: usize },

    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("cannot {operation} while {state}")]
    StateConflict { operation: String, state: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{operation} failed: {message}")]
    External { operation: String, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("cyclic dependency among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto its broad failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_)
            | Self::DuplicateEngine(_)
            | Self::InvalidEngine { .. }
            | Self::UnmetDependency { .. }
            | Self::InvalidInput(_) => ErrorKind::Configuration,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::External { .. } | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::ExternalFailure
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CyclicDependency(_) => ErrorKind::CyclicDependency,
        }
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn state_conflict(operation: impl Into<String>, state: impl fmt::Display) -> Self {
        Self::StateConflict {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Wrap a lower-level failure with the name of the operation that hit it.
    pub fn external(operation: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::External {
            operation: operation.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
