//! Processor-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a processor's `execute` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable`: dispatched again with exponential back-off.
/// - everything else: the node is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Transient failure; the executor should re-try the node.
    #[error("retryable processor error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal processor error: {0}")]
    Fatal(String),

    /// The processor did not finish within its time budget.
    #[error("processor timed out after {0:?}")]
    Timeout(Duration),

    /// No processor is registered under the requested name.
    #[error("processor not found: '{0}'")]
    NotFound(String),
}

impl ProcessorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors returned when registering processors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Names and versions may only contain letters, digits, `_`, `-` and `.`.
    #[error("processor name '{0}' contains invalid characters (allowed: letters, digits, '_', '-', '.')")]
    InvalidName(String),

    /// A processor is already registered under this name and version.
    #[error("processor '{name}' version '{version}' is already registered")]
    AlreadyRegistered { name: String, version: String },
}
