//! Shared test helpers for license tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use verifytheme_license::{
    LicenseConfig, LicenseError, LicenseManager, LicenseRegistry, LicenseResult, ManualClock,
    MemoryStore, PurchaseVerification, RegisterOutcome,
};

pub const PRODUCT_ID: &str = "20473427";
pub const CODE: &str = "a1b2c3d4-0000-4a4a-9b9b-123456789abc";

/// Scriptable in-process registry that records every call it receives.
pub struct FakeRegistry {
    calls: Mutex<Vec<String>>,
    verify_item: Mutex<Option<String>>,
    register_outcome: Mutex<RegisterOutcome>,
    bound_domain: Mutex<Option<String>>,
    unregister_fails: AtomicBool,
    query_fails: AtomicBool,
    hang: AtomicBool,
}

impl FakeRegistry {
    /// A registry that verifies every code as `item_id` and accepts every claim.
    pub fn new(item_id: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            verify_item: Mutex::new(Some(item_id.to_string())),
            register_outcome: Mutex::new(RegisterOutcome::Registered),
            bound_domain: Mutex::new(None),
            unregister_fails: AtomicBool::new(false),
            query_fails: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        }
    }

    pub fn fail_verify(&self) {
        *self.verify_item.lock().unwrap() = None;
    }

    pub fn set_register_outcome(&self, outcome: RegisterOutcome) {
        *self.register_outcome.lock().unwrap() = outcome;
    }

    pub fn set_bound_domain(&self, domain: Option<&str>) {
        *self.bound_domain.lock().unwrap() = domain.map(String::from);
    }

    pub fn fail_unregister(&self) {
        self.unregister_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_query(&self) {
        self.query_fails.store(true, Ordering::SeqCst);
    }

    /// Makes every call block forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    async fn enter(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl LicenseRegistry for FakeRegistry {
    async fn verify(&self, _purchase_code: &str) -> LicenseResult<PurchaseVerification> {
        self.enter("verify").await;
        let item = self.verify_item.lock().unwrap().clone();
        match item {
            Some(item_id) => Ok(PurchaseVerification {
                item_id,
                raw: serde_json::json!({ "ok": true }),
            }),
            None => Err(LicenseError::Remote("connection refused".to_string())),
        }
    }

    async fn register(&self, _purchase_code: &str, domain: &str) -> LicenseResult<RegisterOutcome> {
        self.enter("register").await;
        let outcome = self.register_outcome.lock().unwrap().clone();
        if outcome == RegisterOutcome::Registered {
            self.set_bound_domain(Some(domain));
        }
        Ok(outcome)
    }

    async fn unregister(&self, _purchase_code: &str) -> LicenseResult<()> {
        self.enter("unregister").await;
        if self.unregister_fails.load(Ordering::SeqCst) {
            return Err(LicenseError::Remote("registry unavailable".to_string()));
        }
        self.set_bound_domain(None);
        Ok(())
    }

    async fn query_bound_domain(&self, _purchase_code: &str) -> LicenseResult<Option<String>> {
        self.enter("query_bound_domain").await;
        if self.query_fails.load(Ordering::SeqCst) {
            return Err(LicenseError::Remote("registry unavailable".to_string()));
        }
        Ok(self.bound_domain.lock().unwrap().clone())
    }
}

pub type TestManager = LicenseManager<Arc<MemoryStore>, Arc<FakeRegistry>, Arc<ManualClock>>;

/// Everything a manager test needs to drive and observe the state machine.
pub struct Harness {
    pub manager: TestManager,
    pub registry: Arc<FakeRegistry>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(LicenseConfig::for_product(PRODUCT_ID))
}

pub fn harness_with(config: LicenseConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let registry = Arc::new(FakeRegistry::new(PRODUCT_ID));
    let manager = LicenseManager::new(config, store.clone(), registry.clone(), clock.clone());
    Harness {
        manager,
        registry,
        store,
        clock,
    }
}
