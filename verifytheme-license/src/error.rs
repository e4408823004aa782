//! Error types for the licensing module.

use thiserror::Error;

/// Licensing-specific errors.
///
/// Every variant is recoverable: the caller may retry, prompt the operator,
/// or accept the outcome.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Purchase code is empty or whitespace.
    #[error("invalid purchase code: a purchase code is required")]
    InvalidCode,

    /// The purchase code verified, but for a different product.
    #[error("invalid purchase: code is not valid for item {expected}")]
    InvalidPurchase {
        /// Configured product id.
        expected: String,
        /// Item id the registry returned; empty when it recognized no item.
        found: String,
    },

    /// The purchase code is bound to another domain.
    #[error("{}", conflict_message(.0))]
    DomainConflict(Option<String>),

    /// Transport failure, timeout, or malformed response from the registry.
    #[error("remote license registry error: {0}")]
    Remote(String),

    /// The registry reports no binding, so local state was cleared.
    #[error("license was deactivated because the registry holds no binding for it")]
    AutoDeactivated,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn conflict_message(domain: &Option<String>) -> String {
    match domain {
        Some(domain) => format!("purchase code is already in use on another domain: {domain}"),
        None => "purchase code is already in use on another domain".to_string(),
    }
}

impl LicenseError {
    /// Returns true for errors caused by operator input rather than the
    /// environment.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidCode | Self::InvalidPurchase { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Storage(_))
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
