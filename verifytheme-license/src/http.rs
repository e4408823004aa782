//! HTTP implementation of [`LicenseRegistry`].
//!
//! Every capability is a form-encoded POST against the license endpoint.
//! Verification bodies come in three known shapes, decoded through
//! [`VerifyResponse`] rather than probed field by field.

use crate::config::LicenseConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::registry::{LicenseRegistry, PurchaseVerification, RegisterOutcome};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::{debug, warn};

const CHECK_PURCHASE: &str = "license/check_purchase.php";
const ADD_LICENSE: &str = "license/add_license.php";
const DELETE_LICENSE: &str = "license/delete_license.php";
const GET_LICENSE: &str = "license/get_license.php";

/// Known verification response shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VerifyResponse {
    /// `{"data": {"item": {"id": ..}}}`
    Wrapped { data: WrappedItem },
    /// `{"item": {"id": ..}}`
    Bare { item: ItemRef },
    /// `{"verify-purchase": {"item_id": ..}}`
    Legacy {
        #[serde(rename = "verify-purchase")]
        verify_purchase: LegacyPurchase,
    },
}

impl VerifyResponse {
    fn into_item_id(self) -> String {
        match self {
            Self::Wrapped { data } => data.item.id,
            Self::Bare { item } => item.id,
            Self::Legacy { verify_purchase } => verify_purchase.item_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WrappedItem {
    item: ItemRef,
}

#[derive(Debug, Deserialize)]
struct ItemRef {
    #[serde(deserialize_with = "id_string")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct LegacyPurchase {
    #[serde(deserialize_with = "id_string")]
    item_id: String,
}

/// Accepts numeric or string identifiers.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number item id, got {other}"
        ))),
    }
}

/// License registry reached over HTTP.
pub struct HttpLicenseRegistry {
    client: Client,
    base_url: String,
    user_name: Option<String>,
}

impl HttpLicenseRegistry {
    /// Creates a registry client from configuration.
    pub fn new(config: &LicenseConfig) -> LicenseResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.remote_timeout_secs))
            .user_agent(concat!("verifytheme/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LicenseError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            user_name: config.user_name.clone().filter(|u| !u.trim().is_empty()),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, endpoint: &str, fields: &[(&str, &str)]) -> LicenseResult<(StatusCode, String)> {
        let url = format!("{}/{endpoint}", self.base_url);
        debug!(%url, "license registry request");

        let response = self
            .client
            .post(&url)
            .form(fields)
            .send()
            .await
            .map_err(|e| LicenseError::Remote(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LicenseError::Remote(format!("failed to read {endpoint} response: {e}")))?;
        Ok((status, body))
    }
}

fn unexpected_status(endpoint: &str, status: StatusCode, body: &str) -> LicenseError {
    let snippet: String = body.chars().take(200).collect();
    LicenseError::Remote(format!("{endpoint} returned {status}: {snippet}"))
}

fn parse_json(body: &str) -> Option<serde_json::Value> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn domain_field(value: &serde_json::Value) -> Option<String> {
    value
        .get("domain")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
}

/// Decodes a `get_license` body. Only an explicitly empty answer means
/// "no binding"; anything unrecognised is an error so that a broken
/// registry response never clears a valid license.
fn bound_domain(body: &str) -> LicenseResult<Option<String>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let non_empty = |d: &str| {
        let d = d.trim();
        (!d.is_empty()).then(|| d.to_string())
    };

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Null) => Ok(None),
        Ok(serde_json::Value::String(domain)) => Ok(non_empty(domain.as_str())),
        Ok(serde_json::Value::Object(map)) => match map.get("domain") {
            Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(domain)) => Ok(non_empty(domain.as_str())),
            _ => Err(unrecognized_binding(trimmed)),
        },
        Ok(serde_json::Value::Array(domains)) if domains.is_empty() => Ok(None),
        Ok(serde_json::Value::Array(domains)) => match domains.first() {
            Some(serde_json::Value::String(domain)) => Ok(non_empty(domain.as_str())),
            _ => Err(unrecognized_binding(trimmed)),
        },
        Ok(_) => Err(unrecognized_binding(trimmed)),
        // Older registries answer with the bare host name.
        Err(_) if !trimmed.contains(char::is_whitespace) && !trimmed.contains(['<', '>']) => {
            Ok(Some(trimmed.to_string()))
        }
        Err(_) => Err(unrecognized_binding(trimmed)),
    }
}

fn unrecognized_binding(body: &str) -> LicenseError {
    let snippet: String = body.chars().take(200).collect();
    LicenseError::Remote(format!("unrecognized get_license response: {snippet}"))
}

#[async_trait]
impl LicenseRegistry for HttpLicenseRegistry {
    async fn verify(&self, purchase_code: &str) -> LicenseResult<PurchaseVerification> {
        let (status, body) = self
            .post(CHECK_PURCHASE, &[("purchase_code", purchase_code)])
            .await?;

        // An unknown code verifies to no item, which can never match the product.
        if status == StatusCode::NOT_FOUND {
            return Ok(PurchaseVerification {
                item_id: String::new(),
                raw: serde_json::Value::Null,
            });
        }
        if !status.is_success() {
            return Err(unexpected_status(CHECK_PURCHASE, status, &body));
        }

        let raw: serde_json::Value = serde_json::from_str(body.trim())
            .map_err(|e| LicenseError::Remote(format!("malformed verification response: {e}")))?;

        if let Some(error) = raw.get("error").and_then(serde_json::Value::as_str) {
            return Err(LicenseError::Remote(format!("verification rejected: {error}")));
        }

        let item_id = match serde_json::from_value::<VerifyResponse>(raw.clone()) {
            Ok(response) => response.into_item_id(),
            Err(_) if raw.get("verify-purchase").is_some() => String::new(),
            Err(e) => {
                return Err(LicenseError::Remote(format!(
                    "unrecognized verification response: {e}"
                )));
            }
        };

        Ok(PurchaseVerification { item_id, raw })
    }

    async fn register(&self, purchase_code: &str, domain: &str) -> LicenseResult<RegisterOutcome> {
        let mut fields = vec![("purchase_code", purchase_code), ("domain", domain)];
        if let Some(user_name) = &self.user_name {
            fields.push(("user_name", user_name.as_str()));
        }
        let (status, body) = self.post(ADD_LICENSE, &fields).await?;

        let json = parse_json(&body);
        if status == StatusCode::CONFLICT {
            return Ok(RegisterOutcome::Conflict {
                domain: json.as_ref().and_then(domain_field),
            });
        }
        if !status.is_success() {
            return Err(unexpected_status(ADD_LICENSE, status, &body));
        }

        let outcome = match json {
            Some(value) => match value.get("success").and_then(serde_json::Value::as_bool) {
                Some(true) => RegisterOutcome::Registered,
                Some(false) => RegisterOutcome::Conflict {
                    domain: domain_field(&value),
                },
                None if value.as_u64().is_some_and(|id| id > 0) => RegisterOutcome::Registered,
                None => RegisterOutcome::Unacknowledged,
            },
            None => RegisterOutcome::Unacknowledged,
        };

        if outcome == RegisterOutcome::Unacknowledged {
            warn!(domain, "registry did not acknowledge domain registration");
        }
        Ok(outcome)
    }

    async fn unregister(&self, purchase_code: &str) -> LicenseResult<()> {
        let (status, body) = self
            .post(DELETE_LICENSE, &[("purchase_code", purchase_code)])
            .await?;
        if !status.is_success() {
            return Err(unexpected_status(DELETE_LICENSE, status, &body));
        }

        let confirmed = match parse_json(&body) {
            Some(value) if value.get("success").is_some() => {
                value.get("success").and_then(serde_json::Value::as_bool) == Some(true)
            }
            _ => {
                let lowered = body.to_ascii_lowercase();
                lowered.contains("true") || lowered.contains('1')
            }
        };

        if confirmed {
            Ok(())
        } else {
            Err(LicenseError::Remote(
                "registry did not confirm domain release".to_string(),
            ))
        }
    }

    async fn query_bound_domain(&self, purchase_code: &str) -> LicenseResult<Option<String>> {
        let (status, body) = self
            .post(GET_LICENSE, &[("purchase_code", purchase_code)])
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(unexpected_status(GET_LICENSE, status, &body));
        }

        bound_domain(&body)
    }
}
