//! License binding lifecycle.
//!
//! A purchase code is bound to at most one domain at a time. The registry
//! enforces that; this module keeps the local record of the binding in step
//! with it:
//!
//! - `activate`: verify the code, claim the domain, persist [`LicenseState`]
//! - `force_activate`: as `activate`, releasing any existing binding first
//! - `deactivate`: release the claim, clear local state (always)
//! - `reconcile`: compare local state with the registry's binding
//!
//! Local and development hosts activate without claiming a registry binding.

use crate::clock::Clock;
use crate::config::LicenseConfig;
use crate::domain::{domains_match, host_of, is_local_host};
use crate::error::{LicenseError, LicenseResult};
use crate::registry::{LicenseRegistry, RegisterOutcome};
use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Locally persisted license binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseState {
    /// Verified purchase code.
    pub purchase_code: String,
    /// Host the code was activated on.
    pub domain: String,
    /// Activation time (seconds since epoch).
    pub activated_at: i64,
}

impl LicenseState {
    /// Purchase code with everything but the last four characters hidden.
    #[must_use]
    pub fn masked_code(&self) -> String {
        mask_code(&self.purchase_code)
    }

    /// Activation time as RFC 3339, if representable.
    #[must_use]
    pub fn activated_at_rfc3339(&self) -> Option<String> {
        chrono::DateTime::from_timestamp(self.activated_at, 0).map(|dt| dt.to_rfc3339())
    }
}

pub(crate) fn mask_code(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let visible = chars.len().saturating_sub(4);
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < visible { '*' } else { *c })
        .collect()
}

/// Drives activation, deactivation and reconciliation of the license.
pub struct LicenseManager<S, R, C> {
    config: LicenseConfig,
    store: S,
    registry: R,
    clock: C,
}

impl<S, R, C> LicenseManager<S, R, C>
where
    S: KeyValueStore,
    R: LicenseRegistry,
    C: Clock,
{
    /// Creates a manager over explicit collaborators.
    pub fn new(config: LicenseConfig, store: S, registry: R, clock: C) -> Self {
        Self {
            config,
            store,
            registry,
            clock,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &LicenseConfig {
        &self.config
    }

    /// Store key the license state lives under.
    #[must_use]
    pub fn state_key(&self) -> &str {
        &self.config.state_key
    }

    /// True if `domain` activates without a registry binding.
    #[must_use]
    pub fn is_local_domain(&self, domain: &str) -> bool {
        is_local_host(domain, &self.config.local_suffixes)
    }

    /// Reads the persisted license state.
    pub fn license_state(&self) -> LicenseResult<Option<LicenseState>> {
        self.store.get_json(&self.config.state_key)
    }

    /// True iff a license state with a non-empty purchase code is stored.
    ///
    /// Never contacts the registry; see [`reconcile`](Self::reconcile).
    #[must_use]
    pub fn is_activated(&self) -> bool {
        match self.license_state() {
            Ok(state) => state.is_some_and(|s| !s.purchase_code.is_empty()),
            Err(e) => {
                warn!("failed to read license state: {e}");
                false
            }
        }
    }

    /// Verifies `purchase_code`, claims `domain` for it and persists the
    /// binding. Prior local state is only replaced on success.
    pub async fn activate(&self, purchase_code: &str, domain: &str) -> LicenseResult<LicenseState> {
        self.bind(purchase_code, domain, false).await
    }

    /// Like [`activate`](Self::activate), but first releases whatever domain
    /// the code is bound to, taking the binding over for `domain`.
    ///
    /// A failed release is logged and the claim is attempted anyway; the
    /// registry still rejects it if the old binding survived.
    pub async fn force_activate(
        &self,
        purchase_code: &str,
        domain: &str,
    ) -> LicenseResult<LicenseState> {
        self.bind(purchase_code, domain, true).await
    }

    async fn bind(&self, purchase_code: &str, domain: &str, force: bool) -> LicenseResult<LicenseState> {
        let code = purchase_code.trim();
        if code.is_empty() {
            return Err(LicenseError::InvalidCode);
        }
        let host = host_of(domain);
        if host.is_empty() {
            return Err(LicenseError::Config("site domain is required".to_string()));
        }

        let verification = self
            .remote("verify", self.registry.verify(code))
            .await?;
        if verification.item_id != self.config.product_id {
            info!(
                code = %mask_code(code),
                item_id = %verification.item_id,
                "purchase code belongs to another item"
            );
            return Err(LicenseError::InvalidPurchase {
                expected: self.config.product_id.clone(),
                found: verification.item_id,
            });
        }

        if self.is_local_domain(&host) {
            debug!(domain = %host, "local host, skipping domain registration");
        } else {
            if force {
                if let Err(e) = self.remote("unregister", self.registry.unregister(code)).await {
                    warn!(code = %mask_code(code), "forced activation could not release binding: {e}");
                }
            }
            let outcome = self
                .remote("register", self.registry.register(code, &host))
                .await?;
            match outcome {
                RegisterOutcome::Registered => {}
                RegisterOutcome::Unacknowledged if self.config.accept_unacknowledged_registration => {
                    warn!(domain = %host, "registration unacknowledged, treating as registered");
                }
                RegisterOutcome::Unacknowledged => {
                    return Err(LicenseError::Remote(
                        "registry did not acknowledge domain registration".to_string(),
                    ));
                }
                RegisterOutcome::Conflict { domain } => {
                    info!(
                        code = %mask_code(code),
                        other = domain.as_deref().unwrap_or("unknown"),
                        "purchase code bound to another domain"
                    );
                    return Err(LicenseError::DomainConflict(domain));
                }
            }
        }

        let state = LicenseState {
            purchase_code: code.to_string(),
            domain: host,
            activated_at: self.clock.now(),
        };
        self.store.set_json(&self.config.state_key, &state, None)?;
        info!(code = %state.masked_code(), domain = %state.domain, forced = force, "license activated");
        Ok(state)
    }

    /// Releases the registry binding and clears local state.
    ///
    /// Local state is cleared even when the registry call fails; that
    /// failure is still returned so it can be surfaced.
    pub async fn deactivate(&self) -> LicenseResult<()> {
        let Some(state) = self.license_state()? else {
            debug!("deactivate with no local license, nothing to do");
            return Ok(());
        };

        let released = if self.is_local_domain(&state.domain) {
            Ok(())
        } else {
            self.remote("unregister", self.registry.unregister(&state.purchase_code))
                .await
        };

        self.store.delete(&self.config.state_key)?;

        match released {
            Ok(()) => {
                info!(code = %state.masked_code(), domain = %state.domain, "license deactivated");
                Ok(())
            }
            Err(e) => {
                warn!(
                    code = %state.masked_code(),
                    "local license cleared but registry release failed: {e}"
                );
                Err(e)
            }
        }
    }

    /// Checks the registry's binding for the stored code against
    /// `current_domain`, the host this installation is serving now.
    ///
    /// - no binding remotely: local state is cleared, `AutoDeactivated`
    /// - binding to another site: local state is kept, `DomainConflict`
    pub async fn reconcile(&self, current_domain: &str) -> LicenseResult<()> {
        let Some(state) = self.license_state()? else {
            return Ok(());
        };
        let current = host_of(current_domain);
        if current.is_empty() {
            return Err(LicenseError::Config("site domain is required".to_string()));
        }
        if self.is_local_domain(&current) {
            return Ok(());
        }

        let bound = self
            .remote(
                "query_bound_domain",
                self.registry.query_bound_domain(&state.purchase_code),
            )
            .await?;

        match bound {
            None => {
                self.store.delete(&self.config.state_key)?;
                info!(code = %state.masked_code(), "registry holds no binding, license cleared");
                Err(LicenseError::AutoDeactivated)
            }
            Some(remote) if domains_match(&remote, &current) || self.is_local_domain(&remote) => {
                debug!(remote = %remote, current = %current, "license binding consistent");
                Ok(())
            }
            Some(remote) => {
                warn!(
                    remote = %remote,
                    current = %current,
                    activated_on = %state.domain,
                    "license bound to another domain"
                );
                Err(LicenseError::DomainConflict(Some(remote)))
            }
        }
    }

    async fn remote<T>(
        &self,
        op: &str,
        call: impl Future<Output = LicenseResult<T>>,
    ) -> LicenseResult<T> {
        let limit = Duration::from_secs(self.config.remote_timeout_secs);
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_secs = self.config.remote_timeout_secs, "registry call timed out");
                Err(LicenseError::Remote(format!(
                    "{op} timed out after {}s",
                    self.config.remote_timeout_secs
                )))
            }
        }
    }
}
