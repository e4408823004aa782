//! Remote license registry abstraction.
//!
//! The registry is the single source of truth for which domain a purchase
//! code is bound to. Nothing local is authoritative about bindings.

use crate::error::LicenseResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of verifying a purchase code with the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseVerification {
    /// Identifier of the item the code was sold for.
    pub item_id: String,
    /// Undecoded response body, kept for diagnostics.
    pub raw: serde_json::Value,
}

/// Result of claiming a domain for a purchase code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// The registry confirmed the claim.
    Registered,
    /// The registry answered without confirming or rejecting the claim.
    Unacknowledged,
    /// The code is already bound elsewhere.
    Conflict {
        /// The other domain, when the registry names it.
        domain: Option<String>,
    },
}

/// Remote capabilities consumed by the license state machine.
#[async_trait]
pub trait LicenseRegistry: Send + Sync {
    /// Verifies a purchase code and reports which item it belongs to.
    async fn verify(&self, purchase_code: &str) -> LicenseResult<PurchaseVerification>;

    /// Claims `domain` for `purchase_code`.
    async fn register(&self, purchase_code: &str, domain: &str) -> LicenseResult<RegisterOutcome>;

    /// Releases whatever domain `purchase_code` is bound to.
    async fn unregister(&self, purchase_code: &str) -> LicenseResult<()>;

    /// Reads the domain currently bound to `purchase_code`.
    async fn query_bound_domain(&self, purchase_code: &str) -> LicenseResult<Option<String>>;
}

#[async_trait]
impl<R: LicenseRegistry + ?Sized> LicenseRegistry for std::sync::Arc<R> {
    async fn verify(&self, purchase_code: &str) -> LicenseResult<PurchaseVerification> {
        (**self).verify(purchase_code).await
    }

    async fn register(&self, purchase_code: &str, domain: &str) -> LicenseResult<RegisterOutcome> {
        (**self).register(purchase_code, domain).await
    }

    async fn unregister(&self, purchase_code: &str) -> LicenseResult<()> {
        (**self).unregister(purchase_code).await
    }

    async fn query_bound_domain(&self, purchase_code: &str) -> LicenseResult<Option<String>> {
        (**self).query_bound_domain(purchase_code).await
    }
}
