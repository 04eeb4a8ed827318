//! Common test utilities for courier-webhooks integration tests.
//!
//! Provides wiremock responders, signature helpers and an engine assembled
//! from the in-memory doubles, so delivery behavior can be verified without
//! a database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use courier_webhooks::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use courier_webhooks::memory::{
    InMemoryEventRepository, InMemorySubscriptionRepository, MockWebhookTransport,
    RecordingRetryScheduler,
};
use courier_webhooks::ports::WebhookTransport;
use courier_core::EventId;
use courier_webhooks::{
    CircuitBreakerGuard, DeliveryError, DeliveryService, DispatchOutcome, NotificationEvent,
    WebhookSubscription,
};
use wiremock::{Request, Respond, ResponseTemplate};

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        // Only initialize if RUST_LOG is set
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Standard test clients
pub const CLIENT_A: &str = "client-a";
pub const CLIENT_B: &str = "client-b";

pub const EVENT_TYPE: &str = "order.created";

/// Standard test secrets
pub const SECRET_1: &str = "whsec_test_secret_key_12345";
pub const SECRET_2: &str = "whsec_another_secret_67890";

pub const ORDER_PAYLOAD: &str = r#"{"order_id":"ord_1001","total":{"amount":4200,"currency":"EUR"}}"#;

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting webhook requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
    body: Option<String>,
}

impl CaptureResponder {
    /// Create a new capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    /// Create a capture responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
            body: None,
        }
    }

    /// Answer with `body` as well.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Get all captured requests.
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        self.requests.lock().unwrap().push(captured);

        let template = ResponseTemplate::new(self.response_code);
        match &self.body {
            Some(body) => template.set_body_string(body.clone()),
            None => template,
        }
    }
}

// ---------------------------------------------------------------------------
// CountingResponder - counts requests
// ---------------------------------------------------------------------------

/// A wiremock responder that counts incoming requests.
#[derive(Clone)]
pub struct CountingResponder {
    count: Arc<AtomicU32>,
    response_code: u16,
}

impl CountingResponder {
    /// Create a new counting responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    /// Create a counting responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            response_code: status,
        }
    }

    /// Get the current request count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.count.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

/// A wiremock responder that fails a specified number of times before succeeding.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
    success_code: u16,
}

impl FailingResponder {
    /// Create a responder that fails `n` times with 500, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    /// Create a responder that fails with a custom status code.
    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
            success_code: 200,
        }
    }

    /// Get the current attempt count.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(self.success_code)
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedResponder - adds response delay
// ---------------------------------------------------------------------------

/// A wiremock responder that adds a delay before responding.
#[derive(Clone)]
pub struct DelayedResponder {
    delay_ms: u64,
    response_code: u16,
}

impl DelayedResponder {
    /// Create a responder that delays for `ms` milliseconds.
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            response_code: 200,
        }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(self.response_code).set_delay(Duration::from_millis(self.delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Helper functions for signature verification
// ---------------------------------------------------------------------------

/// Compute the base64 HMAC-SHA256 of `body` the way a receiver would.
pub fn compute_test_signature(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);

    STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify a webhook signature from a captured request.
pub fn verify_captured_signature(request: &CapturedRequest, secret: &str) -> bool {
    match request.header("x-webhook-signature") {
        Some(signature) => signature == compute_test_signature(secret, &request.body),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Engine assembled from in-memory doubles
// ---------------------------------------------------------------------------

/// A [`DeliveryService`] wired to in-memory repositories.
pub struct TestEngine {
    pub events: Arc<InMemoryEventRepository>,
    pub subscriptions: Arc<InMemorySubscriptionRepository>,
    pub scheduler: Arc<RecordingRetryScheduler>,
    pub registry: CircuitBreakerRegistry,
    pub service: DeliveryService,
}

impl TestEngine {
    /// Engine with the default breaker configuration.
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Self {
        Self::with_breaker(transport, CircuitBreakerConfig::default())
    }

    /// Engine with a custom breaker configuration.
    pub fn with_breaker(transport: Arc<dyn WebhookTransport>, config: CircuitBreakerConfig) -> Self {
        init_test_logging();

        let events = Arc::new(InMemoryEventRepository::new());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let scheduler = Arc::new(RecordingRetryScheduler::new());
        let registry = CircuitBreakerRegistry::new(config);
        let guard = CircuitBreakerGuard::new(registry.clone(), transport);
        let service =
            DeliveryService::new(events.clone(), subscriptions.clone(), guard, scheduler.clone());

        Self {
            events,
            subscriptions,
            scheduler,
            registry,
            service,
        }
    }

    /// Register an active subscription for `client_id` on [`EVENT_TYPE`].
    pub fn subscribe(&self, client_id: &str, url: &str, secret: &str) -> WebhookSubscription {
        let subscription = WebhookSubscription::new(client_id, EVENT_TYPE, url, secret);
        self.subscriptions.insert(subscription.clone());
        subscription
    }

    /// Store a new pending event for `client_id` targeting `url`.
    pub fn seed_event(&self, client_id: &str, url: &str) -> NotificationEvent {
        let event = NotificationEvent::new(client_id, EVENT_TYPE, ORDER_PAYLOAD, url);
        self.events.insert(event.clone());
        event
    }

    /// Let the event's backoff elapse, then dispatch it.
    pub async fn dispatch_when_due(&self, id: EventId) -> Result<DispatchOutcome, DeliveryError> {
        self.events.make_due(id);
        self.service.dispatch(id).await
    }
}

/// Engine backed by a [`MockWebhookTransport`] answering `status`.
pub fn mock_engine(status: u16) -> (TestEngine, Arc<MockWebhookTransport>) {
    let transport = Arc::new(MockWebhookTransport::with_status(status));
    (TestEngine::new(transport.clone()), transport)
}
