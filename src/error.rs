//! Fault kinds raised by the filter core.
//!
//! Per-packet faults (decode, scoring, reinjection) are absorbed by the worker
//! that hit them. Only configuration and interceptor faults ever reach the
//! controller.

use thiserror::Error;

/// Malformed or missing configuration. Fatal to a (re)start only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("too many {what}: {count} configured, at most {max} allowed")]
    OverCapacity {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("confusable '{source_char}' maps to both '{first}' and '{second}'")]
    AmbiguousConfusable {
        source_char: char,
        first: String,
        second: String,
    },

    #[error("confusable mapping for '{source_char}' never settles (cycle)")]
    ConfusableCycle { source_char: char },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// A rule pattern that failed to compile. The rule stays in its slot but
/// never matches.
#[derive(Debug, Clone, Error)]
#[error("rule '{rule}' has an invalid pattern: {reason}")]
pub struct RuleError {
    pub rule: String,
    pub reason: String,
}

/// Faults raised across the packet interception boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptorError {
    /// The handle was closed. Expected during stop and reload.
    #[error("interceptor is shut down")]
    Shutdown,

    #[error("failed to open interceptor with filter '{filter}': {reason}")]
    Open { filter: String, reason: String },

    #[error("transient receive failure: {0}")]
    Transient(String),

    #[error("reinjection refused: {0}")]
    Reinject(String),
}

impl InterceptorError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, InterceptorError::Shutdown)
    }
}

/// Errors returned by controller operations invoked from the shell.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("configuration fault: {0}")]
    Config(#[from] ConfigError),

    #[error("interceptor fault: {0}")]
    Interceptor(#[from] InterceptorError),

    #[error("a fault is pending ({0}); acknowledge it before starting again")]
    FaultPending(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}
