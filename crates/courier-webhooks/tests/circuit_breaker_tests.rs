//! Integration tests for circuit breaking around delivery attempts.
//!
//! Tests that an open circuit short-circuits attempts, that short-circuited
//! attempts are recorded like transport failures, and that breakers recover
//! through half-open probes.

mod common;

use std::sync::Arc;

use common::*;
use courier_webhooks::guard::BREAKER_OPEN_MESSAGE;
use courier_webhooks::memory::MockWebhookTransport;
use courier_webhooks::{
    AttemptOutcome, CircuitBreakerConfig, CircuitBreakerGuard, CircuitBreakerRegistry,
    CircuitState, DeliveryStatus, DispatchOutcome, HttpWebhookTransport,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

const URL: &str = "https://hooks.client-a.test/orders";
const OTHER_URL: &str = "https://hooks.client-b.test/orders";

// Opens after two failures in a window of two and stays open for an hour.
fn tripping_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_window_size(2)
        .with_minimum_calls(2)
        .with_open_duration(3600)
}

async fn trip(engine: &TestEngine, url: &str) {
    for _ in 0..2 {
        let warmup = engine.seed_event(CLIENT_A, url);
        engine.service.dispatch(warmup.id()).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Short-circuit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_circuit_skips_transport_and_counts_attempt() {
    let transport = Arc::new(MockWebhookTransport::with_status(500));
    let engine = TestEngine::with_breaker(transport.clone(), tripping_config());
    engine.subscribe(CLIENT_A, URL, SECRET_1);

    trip(&engine, URL).await;
    let status = engine.registry.get_status("https://hooks.client-a.test:443").await.unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(transport.request_count(), 2);

    let event = engine.seed_event(CLIENT_A, URL);
    let outcome = engine.service.dispatch(event.id()).await.unwrap();

    // No request reached the destination.
    assert_eq!(transport.request_count(), 2);
    assert!(matches!(outcome, DispatchOutcome::Retrying { attempts: 1, .. }));

    let stored = engine.events.get(event.id()).unwrap();
    assert_eq!(stored.delivery_status(), DeliveryStatus::Retrying);
    assert_eq!(stored.delivery_attempts(), 1);
    assert_eq!(stored.error_message(), Some(BREAKER_OPEN_MESSAGE));
    assert_eq!(stored.response_code(), None);
    assert!(engine
        .scheduler
        .scheduled()
        .iter()
        .any(|(id, delay)| *id == event.id() && delay.as_secs() == 300));
}

#[tokio::test]
async fn open_circuit_exhausts_budget_like_transport_failures() {
    let transport = Arc::new(MockWebhookTransport::with_status(500));
    let engine = TestEngine::with_breaker(transport.clone(), tripping_config());
    engine.subscribe(CLIENT_A, URL, SECRET_1);
    trip(&engine, URL).await;

    let event = engine.seed_event(CLIENT_A, URL);
    for _ in 0..7 {
        engine.dispatch_when_due(event.id()).await.unwrap();
    }

    let stored = engine.events.get(event.id()).unwrap();
    assert_eq!(stored.delivery_status(), DeliveryStatus::Failed);
    assert_eq!(stored.delivery_attempts(), 7);
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn breakers_are_isolated_per_destination() {
    let transport = Arc::new(MockWebhookTransport::with_status(500));
    let engine = TestEngine::with_breaker(transport.clone(), tripping_config());
    engine.subscribe(CLIENT_A, URL, SECRET_1);
    trip(&engine, URL).await;

    let other = engine.seed_event(CLIENT_A, OTHER_URL);
    engine.service.dispatch(other.id()).await.unwrap();

    // The healthy-until-now destination was still called.
    assert_eq!(transport.request_count(), 3);
    assert_eq!(transport.requests()[2].url, OTHER_URL);

    let statuses = engine.registry.get_all_status().await;
    assert_eq!(statuses.len(), 2);
}

#[tokio::test]
async fn guard_reports_short_circuit() {
    let registry = CircuitBreakerRegistry::new(tripping_config());
    let transport = Arc::new(MockWebhookTransport::with_status(502));
    let guard = CircuitBreakerGuard::new(registry.clone(), transport.clone());

    let event = courier_webhooks::NotificationEvent::new(CLIENT_A, EVENT_TYPE, "{}", URL);
    let headers = courier_webhooks::WebhookHeaders::for_event(
        &event,
        compute_test_signature(SECRET_1, b"{}"),
        chrono::Utc::now(),
    );

    for _ in 0..2 {
        let outcome = guard.call(URL, b"{}", &headers).await;
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                message: "HTTP 502".to_string(),
                status_code: Some(502),
                short_circuited: false,
            }
        );
    }

    let outcome = guard.call(URL, b"{}", &headers).await;
    assert_eq!(
        outcome,
        AttemptOutcome::Failed {
            message: BREAKER_OPEN_MESSAGE.to_string(),
            status_code: None,
            short_circuited: true,
        }
    );
    assert_eq!(transport.request_count(), 2);

    let status = registry
        .get_status("https://hooks.client-a.test:443")
        .await
        .unwrap();
    assert_eq!(status.rejected_calls, 1);
    assert_eq!(status.recent_failures.len(), 2);
    assert_eq!(status.recent_failures[0].response_code, Some(502));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn circuit_recovers_through_probes() {
    let mock_server = MockServer::start().await;
    let responder = FailingResponder::fail_times(2);

    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&mock_server)
        .await;

    let url = format!("{}/webhook", mock_server.uri());
    let config = tripping_config()
        .with_open_duration(0)
        .with_half_open_max_probes(2);
    let engine =
        TestEngine::with_breaker(Arc::new(HttpWebhookTransport::new().unwrap()), config);
    engine.subscribe(CLIENT_A, &url, SECRET_1);

    trip(&engine, &url).await;
    let key = courier_webhooks::circuit_breaker::destination_key(&url);
    assert_eq!(
        engine.registry.get_status(&key).await.unwrap().state,
        CircuitState::Open
    );

    // Open duration of zero admits probes straight away.
    let first = engine.seed_event(CLIENT_A, &url);
    let outcome = engine.service.dispatch(first.id()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered { response_code: 200 });
    assert_eq!(
        engine.registry.get_status(&key).await.unwrap().state,
        CircuitState::HalfOpen
    );

    let second = engine.seed_event(CLIENT_A, &url);
    engine.service.dispatch(second.id()).await.unwrap();
    let status = engine.registry.get_status(&key).await.unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.buffered_calls, 0);
    assert_eq!(responder.attempt_count(), 4);
}
