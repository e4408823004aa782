//! HTTP admin API for license activation.
//!
//! Responses use the `{"success": .., "data": {"message": ..}}` envelope the
//! theme's admin script already understands.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use verifytheme_license::domain::host_of;
use verifytheme_license::{
    Clock, KeyValueStore, LicenseConfig, LicenseError, LicenseManager, LicenseRegistry,
    LicenseState, RateLimiter,
};

/// Header carrying the authenticated admin user id, set by the host.
pub const USER_HEADER: &str = "x-verifytheme-user";

/// Notice shown while the installation has no license.
pub const ACTIVATION_REMINDER: &str = "In order to receive all benefits of our theme, you need \
    to activate your copy of the theme. By activating the theme license you will unlock premium \
    options - import demo data, install & update plugins and official support.";

/// Message returned with a 429 response.
pub const RATE_LIMITED: &str = "Too many activation attempts. Please try again later.";

/// Notice shown after the registry released the binding behind our back.
pub const AUTO_DEACTIVATED: &str = "Your license is no longer registered to any domain and has \
    been deactivated on this site. Please activate it again.";

/// License manager over type-erased collaborators.
pub type AdminManager =
    LicenseManager<Arc<dyn KeyValueStore>, Arc<dyn LicenseRegistry>, Arc<dyn Clock>>;

/// Rate limiter sharing the manager's store and clock.
pub type AdminRateLimiter = RateLimiter<Arc<dyn KeyValueStore>, Arc<dyn Clock>>;

/// Shared state behind the admin routes.
pub struct AdminState {
    manager: AdminManager,
    limiter: AdminRateLimiter,
    site_domain: Option<String>,
}

impl AdminState {
    /// Wires the manager and rate limiter over one store and clock.
    ///
    /// `site_domain` pins the installation's host; without it the request
    /// `Host` header is used.
    pub fn new(
        config: LicenseConfig,
        store: Arc<dyn KeyValueStore>,
        registry: Arc<dyn LicenseRegistry>,
        clock: Arc<dyn Clock>,
        site_domain: Option<String>,
    ) -> Self {
        let limiter = RateLimiter::new(store.clone(), clock.clone());
        let manager = LicenseManager::new(config, store, registry, clock);
        Self {
            manager,
            limiter,
            site_domain: site_domain.filter(|d| !d.trim().is_empty()),
        }
    }

    /// The license manager.
    pub fn manager(&self) -> &AdminManager {
        &self.manager
    }

    fn domain_for(&self, headers: &HeaderMap) -> Option<String> {
        self.site_domain
            .clone()
            .or_else(|| {
                headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(String::from)
            })
            .map(|d| host_of(&d))
            .filter(|d| !d.is_empty())
    }
}

/// Body of `POST /api/v1/license/activate`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActivateRequest {
    pub purchase_code: String,
    /// Release the code's current binding and take it over for this site.
    #[serde(default)]
    pub force: bool,
}

/// Payload of [`ApiResponse`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessageData {
    pub message: String,
}

/// `wp_send_json_*`-style envelope.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub data: MessageData,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: MessageData {
                message: message.into(),
            },
        })
    }

    fn fail(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: MessageData {
                message: message.into(),
            },
        })
    }
}

/// Body of `GET /api/v1/license/status`. The purchase code is masked.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub activated: bool,
    pub purchase_code: Option<String>,
    pub domain: Option<String>,
    pub activated_at: Option<String>,
    pub notice: Option<String>,
}

impl StatusResponse {
    fn new(state: Option<LicenseState>, notice: Option<String>) -> Self {
        let activated = state.as_ref().is_some_and(|s| !s.purchase_code.is_empty());
        let notice = notice.or_else(|| (!activated).then(|| ACTIVATION_REMINDER.to_string()));
        Self {
            activated,
            purchase_code: state.as_ref().map(LicenseState::masked_code),
            domain: state.as_ref().map(|s| s.domain.clone()),
            activated_at: state.as_ref().and_then(LicenseState::activated_at_rfc3339),
            notice,
        }
    }
}

fn conflict_message(domain: Option<&str>) -> String {
    let used = match domain {
        Some(domain) => format!("This product is in use on another domain: {domain}."),
        None => "This product is in use on another domain.".to_string(),
    };
    format!(
        "{used} Are you using this theme for a new site? Please purchase a new license, \
         or deregister the product on the other site first."
    )
}

fn error_response(err: &LicenseError) -> (StatusCode, Json<ApiResponse>) {
    match err {
        LicenseError::InvalidCode => (
            StatusCode::BAD_REQUEST,
            ApiResponse::fail("Please enter a purchase code."),
        ),
        LicenseError::InvalidPurchase { .. } => (
            StatusCode::BAD_REQUEST,
            ApiResponse::fail("Invalid purchase code."),
        ),
        LicenseError::DomainConflict(domain) => (
            StatusCode::CONFLICT,
            ApiResponse::fail(conflict_message(domain.as_deref())),
        ),
        LicenseError::Remote(detail) => (
            StatusCode::BAD_GATEWAY,
            ApiResponse::fail(format!("Could not reach the license server: {detail}")),
        ),
        LicenseError::AutoDeactivated => (StatusCode::CONFLICT, ApiResponse::fail(AUTO_DEACTIVATED)),
        other => {
            error!("license operation failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::fail("Internal error. Please try again."),
            )
        }
    }
}

/// Rate-limit bucket for a request: the authenticated user when the host
/// supplies one, else the client address.
fn actor_key(headers: &HeaderMap) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    if let Some(user) = header_value(USER_HEADER) {
        return format!("user_{user}");
    }
    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(ip) = forwarded.split(',').next().map(str::trim).filter(|ip| !ip.is_empty()) {
            return format!("ip_{ip}");
        }
    }
    "anonymous".to_string()
}

async fn activate_handler(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(request): Json<ActivateRequest>,
) -> Response {
    let actor = actor_key(&headers);
    let policy = state.manager.config().rate_limit;

    match state.limiter.check(&actor, &policy) {
        Ok(true) => {}
        Ok(false) => {
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, ApiResponse::fail(RATE_LIMITED)).into_response();
            if let Ok(Some(secs)) = state.limiter.retry_after(&actor, policy.window_secs) {
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            return response;
        }
        Err(e) => return error_response(&e).into_response(),
    }

    let Some(domain) = state.domain_for(&headers) else {
        warn!("activation request without a resolvable site domain");
        return (
            StatusCode::BAD_REQUEST,
            ApiResponse::fail("Could not determine this site's domain."),
        )
            .into_response();
    };

    let result = if request.force {
        warn!(actor = %actor, domain = %domain, "forced activation requested");
        state.manager.force_activate(&request.purchase_code, &domain).await
    } else {
        state.manager.activate(&request.purchase_code, &domain).await
    };

    match result {
        Ok(license) => {
            info!(actor = %actor, domain = %license.domain, "license activated via admin API");
            ApiResponse::ok(format!("License activated on {}.", license.domain)).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

async fn deactivate_handler(State(state): State<Arc<AdminState>>) -> Response {
    match state.manager.deactivate().await {
        Ok(()) => ApiResponse::ok("License deactivated.").into_response(),
        Err(LicenseError::Remote(detail)) => (
            StatusCode::BAD_GATEWAY,
            ApiResponse::fail(format!(
                "The license was removed from this site, but the license server could not be \
                 updated: {detail}"
            )),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn status_handler(State(state): State<Arc<AdminState>>, headers: HeaderMap) -> Response {
    let reconciled = match state.domain_for(&headers) {
        Some(domain) => state.manager.reconcile(&domain).await,
        None => {
            warn!("status request without a resolvable site domain, skipping reconcile");
            Ok(())
        }
    };
    let notice = match reconciled {
        Ok(()) => None,
        Err(LicenseError::AutoDeactivated) => Some(AUTO_DEACTIVATED.to_string()),
        Err(LicenseError::DomainConflict(domain)) => Some(conflict_message(domain.as_deref())),
        Err(LicenseError::Remote(detail)) => {
            warn!("license reconcile skipped: {detail}");
            None
        }
        Err(e) => return error_response(&e).into_response(),
    };

    match state.manager.license_state() {
        Ok(license) => Json(StatusResponse::new(license, notice)).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// Build the admin API router with the given state.
pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/api/v1/license/activate", post(activate_handler))
        .route("/api/v1/license/deactivate", post(deactivate_handler))
        .route("/api/v1/license/status", get(status_handler))
        .with_state(state)
}
