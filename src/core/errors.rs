use thiserror::Error;

use crate::core::domain::{FaultCause, Language};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl From<Language> for UnsupportedLanguage {
    fn from(language: Language) -> Self {
        UnsupportedLanguage(language.name().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("wall_time_ms ({wall_time_ms}) must not be below cpu_time_ms ({cpu_time_ms})")]
    WallBelowCpu { wall_time_ms: u64, cpu_time_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// The host could not allocate isolation primitives (limit group, uid).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
}

impl From<ProvisionError> for FaultCause {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::ResourceExhausted(msg) => FaultCause::ResourceExhausted(msg),
            ProvisionError::Provisioning(msg) => FaultCause::Provisioning(msg),
        }
    }
}

/// Infrastructure faults of the execution engine. Misbehaviour of the
/// submitted program is never reported through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    #[error("internal error: {msg}")]
    Internal { msg: String },
}

impl ExecuteError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ExecuteError::Internal { msg: msg.into() }
    }
}

impl From<ExecuteError> for FaultCause {
    fn from(err: ExecuteError) -> Self {
        match err {
            ExecuteError::Internal { msg } => FaultCause::Internal(msg),
        }
    }
}

/// Admission faults, returned to the caller without touching a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("rejected: overloaded")]
    Overloaded,
    #[error("rejected: cancelled")]
    Cancelled,
    #[error("rejected: shutting down")]
    ShuttingDown,
    #[error("rejected: judge is unhealthy")]
    Unhealthy,
    #[error("rejected: {0}")]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("rejected: invalid limits: {0}")]
    InvalidLimits(#[from] LimitsError),
}
