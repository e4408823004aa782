//! License service configuration.

use crate::domain::DEFAULT_LOCAL_SUFFIXES;
use crate::error::{LicenseError, LicenseResult};
use crate::rate_limit::RateLimitPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default option key the license state is persisted under.
pub const DEFAULT_STATE_KEY: &str = "verifytheme_settings";

/// Configuration for license activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Item id purchase codes must verify against.
    pub product_id: String,
    /// Base URL of the license registry (e.g. `https://api.bearsthemes.com`).
    pub api_base_url: String,
    /// Upper bound on each registry call, in seconds.
    pub remote_timeout_secs: u64,
    /// Host suffixes that activate without claiming a registry binding.
    pub local_suffixes: Vec<String>,
    /// Whether a registration the registry neither confirms nor rejects
    /// counts as success.
    pub accept_unacknowledged_registration: bool,
    /// Marketplace user name sent along with domain registrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Store key for the persisted [`LicenseState`](crate::LicenseState).
    pub state_key: String,
    /// Activation attempt budget per actor.
    pub rate_limit: RateLimitPolicy,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            product_id: String::new(),
            api_base_url: "https://api.bearsthemes.com".to_string(),
            remote_timeout_secs: 30,
            local_suffixes: DEFAULT_LOCAL_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            accept_unacknowledged_registration: true,
            user_name: None,
            state_key: DEFAULT_STATE_KEY.to_string(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

impl LicenseConfig {
    /// Creates a default configuration for `product_id`.
    #[must_use]
    pub fn for_product(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            ..Default::default()
        }
    }

    /// Loads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LicenseError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the state machine cannot run with.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.product_id.trim().is_empty() {
            return Err(LicenseError::Config("product_id is required".to_string()));
        }
        if self.remote_timeout_secs == 0 {
            return Err(LicenseError::Config(
                "remote_timeout_secs must be positive".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(LicenseError::Config(
                "rate_limit.window_secs must be positive".to_string(),
            ));
        }
        if self.state_key.trim().is_empty() {
            return Err(LicenseError::Config("state_key is required".to_string()));
        }
        Ok(())
    }
}
