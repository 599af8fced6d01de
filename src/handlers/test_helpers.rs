//! Shared test utilities for handler unit tests.
//!
//! Provides a [`TestHarness`] with an `ExperimentManager` over the in-memory
//! store and a canned generator, plus helpers for building requests and
//! reading JSON response bodies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tower::ServiceExt; // for oneshot()

use super::router::build_router;
use super::state::ExperimentManager;
use crate::config::{ServerConfig, StoreBackend};
use crate::generation::SubjectLineGenerator;
use crate::storage::MemoryBanditStore;

/// Generator returning the same lines every time, or failing on demand
pub struct CannedGenerator {
    lines: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl CannedGenerator {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            lines: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SubjectLineGenerator for CannedGenerator {
    fn generate(&self, _content: &str, _original: Option<&str>) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("upstream returned HTTP 500");
        }
        Ok(self.lines.clone())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// A self-contained test environment with its own in-memory store.
pub struct TestHarness {
    pub manager: Arc<ExperimentManager>,
    generator: Arc<CannedGenerator>,
}

impl TestHarness {
    /// Harness whose generator returns five distinct subject lines
    pub fn new() -> Self {
        Self::with_generator(CannedGenerator::new(&[
            "1. Spring is here",
            "2. 30% off everything",
            "3. Your weekend just got better",
            "4. New season, new looks",
            "5. Don't miss the spring drop",
        ]))
    }

    /// Harness whose generator always errors
    pub fn failing() -> Self {
        Self::with_generator(CannedGenerator::failing())
    }

    fn with_generator(generator: CannedGenerator) -> Self {
        let mut config = ServerConfig::default();
        config.store.backend = StoreBackend::Memory;

        let generator = Arc::new(generator);
        let manager = ExperimentManager::with_components(
            config,
            Arc::new(MemoryBanditStore::new()),
            generator.clone(),
        );

        Self {
            manager: Arc::new(manager),
            generator,
        }
    }

    pub fn generator_calls(&self) -> usize {
        self.generator.calls()
    }

    /// Build the full application router.
    pub fn router(&self) -> Router {
        build_router(self.manager.clone())
    }
}

// ---------- Request builders ----------

/// Build a GET request to `uri`.
pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Build a POST request to `uri` with a JSON body.
pub fn post_json<T: serde::Serialize>(uri: &str, body: &T) -> Request<Body> {
    let json = serde_json::to_string(body).unwrap();
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

/// Build a DELETE request to `uri`.
pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ---------- Response helpers ----------

/// Send a request through the router and return (status, JSON body).
pub async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body_bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&body_bytes).to_string())
        })
    };
    (status, json)
}

/// Send a request and deserialize the body into `T`.
pub async fn send_typed<T: DeserializeOwned>(app: Router, req: Request<Body>) -> (StatusCode, T) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body_bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value: T = serde_json::from_slice(&body_bytes).unwrap_or_else(|e| {
        panic!(
            "failed to deserialize response: {e}\nbody: {}",
            String::from_utf8_lossy(&body_bytes)
        )
    });
    (status, value)
}
