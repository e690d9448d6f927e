//! Error types for the fleet controllers

use thiserror::Error;

use crate::provision::ProvisionError;
use crate::store::StoreError;
use crate::worker::JobError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `StoreError`, `ValidationError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Job error: {0}")]
    JobError(#[from] JobError),

    #[error("Provisioning error: {0}")]
    ProvisionError(#[from] ProvisionError),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The requested operation is not allowed in the resource's current state
    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// Whether the failure is likely transient. Only changes how a failure is
    /// reported; the reconcile loop retries every failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StoreError(e) => match e {
                StoreError::Conflict { .. } | StoreError::Backend(_) => true,
                StoreError::CacheClosed(_) => true,
                // The object may appear or vanish later
                StoreError::NotFound { .. } => true,
                StoreError::AlreadyExists { .. } | StoreError::Serialization(_) => false,
            },
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            // Surfaced to the caller synchronously
            Error::JobError(_) => false,
            Error::ValidationError(_) => false,
            Error::StateError(_) => false,
            Error::SerializationError(_) => false,
            Error::ProvisionError(_) => true,
            Error::FinalizerError(_) => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::StoreError(e) => e.is_not_found(),
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::StoreError(e) if e.is_already_exists())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Number of consecutive failures per key logged at `warn` before dropping to `debug`
pub const LOUD_ERROR_LIMIT: u32 = 3;

/// Context for tracking error state across reconcile attempts of one key
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
    }

    /// Whether the most recent error should still be logged loudly
    pub fn should_warn(&self) -> bool {
        self.consecutive_errors <= LOUD_ERROR_LIMIT
    }
}
