use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use verifytheme_admin::{
    build_router, AdminState, ApiResponse, StatusResponse, ACTIVATION_REMINDER, AUTO_DEACTIVATED,
    RATE_LIMITED, USER_HEADER,
};
use verifytheme_license::{
    LicenseConfig, LicenseError, LicenseRegistry, LicenseResult, ManualClock, MemoryStore,
    PurchaseVerification, RateLimitPolicy, RegisterOutcome,
};

const PRODUCT_ID: &str = "20473427";
const CODE: &str = "a1b2c3d4-0000-4a4a-9b9b-123456789abc";

/// Registry holding a single binding in memory.
#[derive(Default)]
struct InMemoryRegistry {
    bound: Mutex<Option<String>>,
    down: Mutex<bool>,
}

impl InMemoryRegistry {
    fn check_up(&self) -> LicenseResult<()> {
        if *self.down.lock().unwrap() {
            Err(LicenseError::Remote("registry unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LicenseRegistry for InMemoryRegistry {
    async fn verify(&self, purchase_code: &str) -> LicenseResult<PurchaseVerification> {
        self.check_up()?;
        let item_id = if purchase_code == CODE { PRODUCT_ID } else { "" };
        Ok(PurchaseVerification {
            item_id: item_id.to_string(),
            raw: serde_json::Value::Null,
        })
    }

    async fn register(&self, _purchase_code: &str, domain: &str) -> LicenseResult<RegisterOutcome> {
        self.check_up()?;
        let mut bound = self.bound.lock().unwrap();
        match bound.as_deref() {
            Some(existing) if existing != domain => Ok(RegisterOutcome::Conflict {
                domain: Some(existing.to_string()),
            }),
            _ => {
                *bound = Some(domain.to_string());
                Ok(RegisterOutcome::Registered)
            }
        }
    }

    async fn unregister(&self, _purchase_code: &str) -> LicenseResult<()> {
        self.check_up()?;
        *self.bound.lock().unwrap() = None;
        Ok(())
    }

    async fn query_bound_domain(&self, _purchase_code: &str) -> LicenseResult<Option<String>> {
        self.check_up()?;
        Ok(self.bound.lock().unwrap().clone())
    }
}

struct TestServer {
    base: String,
    registry: Arc<InMemoryRegistry>,
    client: reqwest::Client,
}

impl TestServer {
    async fn post(&self, route: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{route}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn activate(&self, code: &str) -> reqwest::Response {
        self.post(
            "/api/v1/license/activate",
            serde_json::json!({ "purchase_code": code }),
        )
        .await
    }

    async fn status(&self) -> StatusResponse {
        reqwest::get(format!("{}/api/v1/license/status", self.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

/// Spin up the admin API on an OS-assigned port.
///
/// `domain` pins the site's host; `None` leaves it to the `Host` header.
async fn spawn_test_server(policy: RateLimitPolicy, domain: Option<&str>) -> TestServer {
    let config = LicenseConfig {
        rate_limit: policy,
        ..LicenseConfig::for_product(PRODUCT_ID)
    };
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let registry = Arc::new(InMemoryRegistry::default());
    let state = Arc::new(AdminState::new(
        config,
        store,
        registry.clone(),
        clock,
        domain.map(String::from),
    ));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://127.0.0.1:{}", port),
        registry,
        client: reqwest::Client::new(),
    }
}

async fn default_server() -> TestServer {
    spawn_test_server(RateLimitPolicy::default(), Some("shop.example.com")).await
}

#[tokio::test]
async fn activate_then_status_reports_license() {
    let server = default_server().await;

    let resp = server.activate(CODE).await;
    assert_eq!(resp.status(), 200);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(body.success);
    assert!(body.data.message.contains("shop.example.com"));

    let status = server.status().await;
    assert!(status.activated);
    assert_eq!(status.domain.as_deref(), Some("shop.example.com"));
    assert_eq!(status.notice, None);
    let masked = status.purchase_code.unwrap();
    assert!(masked.ends_with("9abc"));
    assert!(!masked.contains("a1b2"));
    assert_eq!(
        status.activated_at.as_deref(),
        Some("2023-11-14T22:13:20+00:00")
    );
}

#[tokio::test]
async fn status_when_not_activated_shows_reminder() {
    let server = default_server().await;
    let status = server.status().await;
    assert!(!status.activated);
    assert_eq!(status.notice.as_deref(), Some(ACTIVATION_REMINDER));
}

#[tokio::test]
async fn invalid_code_is_bad_request() {
    let server = default_server().await;

    let resp = server.activate("").await;
    assert_eq!(resp.status(), 400);

    let resp = server.activate("not-a-real-code").await;
    assert_eq!(resp.status(), 400);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(!body.success);
    assert_eq!(body.data.message, "Invalid purchase code.");
}

#[tokio::test]
async fn code_bound_elsewhere_is_conflict() {
    let server = default_server().await;
    *server.registry.bound.lock().unwrap() = Some("other-shop.com".to_string());

    let resp = server.activate(CODE).await;
    assert_eq!(resp.status(), 409);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(body.data.message.contains("other-shop.com"));
    assert!(!server.status().await.activated);
}

#[tokio::test]
async fn forced_activation_takes_over_binding() {
    let server = default_server().await;
    *server.registry.bound.lock().unwrap() = Some("other-shop.com".to_string());

    let resp = server
        .post(
            "/api/v1/license/activate",
            serde_json::json!({ "purchase_code": CODE, "force": true }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        server.registry.bound.lock().unwrap().as_deref(),
        Some("shop.example.com")
    );

    let status = server.status().await;
    assert!(status.activated);
    assert_eq!(status.notice, None);
}

#[tokio::test]
async fn status_checks_binding_against_requesting_host() {
    let server = spawn_test_server(RateLimitPolicy::default(), None).await;
    let activate = server
        .client
        .post(format!("{}/api/v1/license/activate", server.base))
        .header("host", "old-shop.com")
        .json(&serde_json::json!({ "purchase_code": CODE }))
        .send()
        .await
        .unwrap();
    assert_eq!(activate.status(), 200);

    let status_from = |host: &'static str| {
        server
            .client
            .get(format!("{}/api/v1/license/status", server.base))
            .header("host", host)
            .send()
    };

    let status: StatusResponse = status_from("old-shop.com").await.unwrap().json().await.unwrap();
    assert_eq!(status.notice, None);

    // Same options, new host: the registry still names the old site.
    let status: StatusResponse = status_from("new-shop.com").await.unwrap().json().await.unwrap();
    assert!(status.activated);
    assert!(status.notice.unwrap().contains("old-shop.com"));
}

#[tokio::test]
async fn registry_down_is_bad_gateway() {
    let server = default_server().await;
    *server.registry.down.lock().unwrap() = true;

    let resp = server.activate(CODE).await;
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn activation_attempts_are_rate_limited_per_user() {
    let policy = RateLimitPolicy {
        max_attempts: 2,
        window_secs: 600,
    };
    let server = spawn_test_server(policy, Some("shop.example.com")).await;
    let url = format!("{}/api/v1/license/activate", server.base);
    let attempt = |user: &'static str| {
        server
            .client
            .post(&url)
            .header(USER_HEADER, user)
            .json(&serde_json::json!({ "purchase_code": "wrong" }))
            .send()
    };

    assert_eq!(attempt("7").await.unwrap().status(), 400);
    assert_eq!(attempt("7").await.unwrap().status(), 400);

    let limited = attempt("7").await.unwrap();
    assert_eq!(limited.status(), 429);
    assert_eq!(
        limited.headers().get("retry-after").unwrap().to_str().unwrap(),
        "600"
    );
    let body: ApiResponse = limited.json().await.unwrap();
    assert_eq!(body.data.message, RATE_LIMITED);

    // Another user has their own budget.
    assert_eq!(attempt("8").await.unwrap().status(), 400);
}

#[tokio::test]
async fn forwarded_address_is_rate_limit_bucket() {
    let policy = RateLimitPolicy {
        max_attempts: 1,
        window_secs: 60,
    };
    let server = spawn_test_server(policy, Some("shop.example.com")).await;
    let url = format!("{}/api/v1/license/activate", server.base);
    let attempt = |ip: &'static str| {
        server
            .client
            .post(&url)
            .header("x-forwarded-for", ip)
            .json(&serde_json::json!({ "purchase_code": "wrong" }))
            .send()
    };

    assert_eq!(attempt("203.0.113.9, 10.0.0.1").await.unwrap().status(), 400);
    assert_eq!(attempt("203.0.113.9").await.unwrap().status(), 429);
    assert_eq!(attempt("198.51.100.4").await.unwrap().status(), 400);
}

#[tokio::test]
async fn deactivate_releases_binding() {
    let server = default_server().await;
    server.activate(CODE).await;

    let resp = server
        .post("/api/v1/license/deactivate", serde_json::json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(*server.registry.bound.lock().unwrap(), None);
    assert!(!server.status().await.activated);
}

#[tokio::test]
async fn deactivate_with_registry_down_still_clears_local() {
    let server = default_server().await;
    server.activate(CODE).await;
    *server.registry.down.lock().unwrap() = true;

    let resp = server
        .post("/api/v1/license/deactivate", serde_json::json!({}))
        .await;
    assert_eq!(resp.status(), 502);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(body.data.message.contains("removed from this site"));

    let status = server.status().await;
    assert!(!status.activated);
}

#[tokio::test]
async fn status_auto_deactivates_released_license() {
    let server = default_server().await;
    server.activate(CODE).await;
    *server.registry.bound.lock().unwrap() = None;

    let status = server.status().await;
    assert!(!status.activated);
    assert_eq!(status.notice.as_deref(), Some(AUTO_DEACTIVATED));
}

#[tokio::test]
async fn status_reports_conflict_but_keeps_license() {
    let server = default_server().await;
    server.activate(CODE).await;
    *server.registry.bound.lock().unwrap() = Some("someone-else.org".to_string());

    let status = server.status().await;
    assert!(status.activated);
    assert!(status.notice.unwrap().contains("someone-else.org"));
}

#[tokio::test]
async fn local_site_activates_without_binding() {
    let server = spawn_test_server(RateLimitPolicy::default(), Some("mysite.local")).await;
    let resp = server.activate(CODE).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(*server.registry.bound.lock().unwrap(), None);
    assert!(server.status().await.activated);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let server = default_server().await;
    let resp = reqwest::get(format!("{}/api/v1/nonexistent", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
