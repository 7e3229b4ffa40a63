//! Error Types
//!
//! Errors are split in two families:
//!
//! - `EngineError`: what a public operation returns when it cannot deliver.
//! - `Failure`: the fail state recorded on a node or controller. A failure is
//!   sticky: it is reported again on every access until the item is
//!   invalidated.
//!
//! Suspension and cancellation are not errors. They travel as
//! [`TaskOutcome`](crate::scheduler::TaskOutcome) and
//! [`TaskStatus`](crate::scheduler::TaskStatus) values.

use std::fmt;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// The phase in which an item failed.
///
/// Ordered: a failure at an earlier phase implies the later phases fail too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailType {
    /// Shape or type resolution failed (no operator, wrong argument types).
    MetaInfo,
    /// Determining the change state of suppliers failed.
    Determine,
    /// Computation or I/O failed after the shape was known.
    Data,
    /// Post-calculation validation failed.
    Validate,
    /// Writing the result to its storage failed.
    Committed,
}

impl fmt::Display for FailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailType::MetaInfo => "MetaInfo",
            FailType::Determine => "Determine",
            FailType::Data => "Data",
            FailType::Validate => "Validate",
            FailType::Committed => "Committed",
        };
        f.write_str(name)
    }
}

/// A recorded failure: the phase plus a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailType,
    pub reason: Arc<str>,
}

impl Failure {
    pub fn new(kind: FailType, reason: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn meta_info(reason: impl Into<Arc<str>>) -> Self {
        Self::new(FailType::MetaInfo, reason)
    }

    pub fn data(reason: impl Into<Arc<str>>) -> Self {
        Self::new(FailType::Data, reason)
    }

    /// Whether this failure blocks progress up to and including `phase`.
    pub fn blocks(&self, phase: FailType) -> bool {
        self.kind <= phase
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.reason)
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("There is no implemented operator for operator name '{0}'")]
    NoImplementedOperator(String),

    #[error("{message}")]
    NoMatchingOperator { group: String, message: String },

    #[error("Unknown operator group '{0}'")]
    UnknownOperatorGroup(String),

    #[error("operator group '{0}' is already registered")]
    DuplicateGroup(String),

    #[error("Cannot find Item {0}")]
    ItemNotFound(String),

    #[error("{0}")]
    Failed(Failure),

    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("calculation of '{0}' requested without interest")]
    NoInterest(String),

    #[error("'{0}' is already scheduled")]
    AlreadyScheduled(String),

    #[error("calculation of '{0}' was cancelled")]
    Cancelled(String),

    #[error("storage '{storage}': {message}")]
    Storage { storage: String, message: String },

    #[error("expected a value of class {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("the engine context has been dropped")]
    ContextDropped,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    /// The failure this error represents when recorded on an item.
    ///
    /// Resolution errors map to MetaInfo failures, everything else to Data.
    pub fn to_failure(&self) -> Failure {
        match self {
            EngineError::Failed(failure) => failure.clone(),
            EngineError::NoImplementedOperator(_)
            | EngineError::NoMatchingOperator { .. }
            | EngineError::UnknownOperatorGroup(_)
            | EngineError::ItemNotFound(_)
            | EngineError::TypeMismatch { .. } => Failure::meta_info(self.to_string()),
            _ => Failure::data(self.to_string()),
        }
    }

    pub fn fail_type(&self) -> Option<FailType> {
        match self {
            EngineError::Failed(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

impl From<Failure> for EngineError {
    fn from(failure: Failure) -> Self {
        EngineError::Failed(failure)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
