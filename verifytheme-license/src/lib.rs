//! Purchase-code licensing for the verifytheme theme.
//!
//! This crate handles:
//! - Purchase code verification against the remote license registry
//! - Binding a purchase code to exactly one domain
//! - Per-actor rate limiting of activation attempts
//! - Reconciling the local license record with the registry
//!
//! # Design Principles
//!
//! - **Registry is authoritative**: domain uniqueness is enforced remotely;
//!   the local record is a cache of the last successful activation
//! - **No ambient globals**: store, registry and clock are injected
//! - **Cheap status checks**: [`LicenseManager::is_activated`] never touches
//!   the network; [`LicenseManager::reconcile`] does
//! - **Local installs are free**: loopback and development hosts activate
//!   without consuming the code's binding
//!
//! # Flow
//!
//! An activation request first passes [`RateLimiter::allow`] for the acting
//! user; only then does [`LicenseManager::activate`] run.

mod clock;
mod config;
pub mod domain;
mod error;
#[cfg(feature = "online")]
mod http;
mod manager;
mod rate_limit;
mod registry;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LicenseConfig, DEFAULT_STATE_KEY};
pub use error::{LicenseError, LicenseResult};
pub use manager::{LicenseManager, LicenseState};
pub use rate_limit::{RateLimitPolicy, RateLimiter, RateRecord, RATE_KEY_PREFIX};
pub use registry::{LicenseRegistry, PurchaseVerification, RegisterOutcome};
pub use store::{FileStore, KeyValueStore, MemoryStore};

#[cfg(feature = "online")]
pub use http::HttpLicenseRegistry;
