//! In-memory implementations of the engine's ports.
//!
//! Used by tests and local runs that have no database or network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::EventId;

use crate::error::DeliveryError;
use crate::models::{EventFilter, NotificationEvent, Page, PageRequest, WebhookSubscription};
use crate::ports::{
    EventRepository, SubscriptionRepository, WebhookHeaders, WebhookResponse, WebhookTransport,
    DEFAULT_CLAIM_LEASE,
};
use crate::services::retry_scheduler::RetryScheduler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event store backed by a map. Counts writes so callers can assert on them.
///
/// Dispatch leases follow the same rules as the Postgres adapter.
pub struct InMemoryEventRepository {
    state: Mutex<EventStore>,
    claim_lease: Duration,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

#[derive(Default)]
struct EventStore {
    events: HashMap<EventId, NotificationEvent>,
    claims: HashMap<EventId, DateTime<Utc>>,
}

impl EventStore {
    fn is_claimed(&self, id: EventId, now: DateTime<Utc>) -> bool {
        self.claims.get(&id).is_some_and(|until| *until > now)
    }
}

fn is_due(event: &NotificationEvent, at: DateTime<Utc>) -> bool {
    !event.delivery_status().is_terminal() && event.next_attempt_at().is_some_and(|due| due <= at)
}

impl Default for InMemoryEventRepository {
    fn default() -> Self {
        Self {
            state: Mutex::new(EventStore::default()),
            claim_lease: DEFAULT_CLAIM_LEASE,
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }
}

impl InMemoryEventRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Store an event without counting it as a save.
    pub fn insert(&self, event: NotificationEvent) {
        let mut state = lock(&self.state);
        state.claims.remove(&event.id());
        state.events.insert(event.id(), event);
    }

    /// Current stored copy of an event.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<NotificationEvent> {
        lock(&self.state).events.get(&id).cloned()
    }

    /// Make a stored event due now and drop its lease, as if its backoff had
    /// elapsed. Returns `false` for unknown ids.
    pub fn make_due(&self, id: EventId) -> bool {
        let mut state = lock(&self.state);
        state.claims.remove(&id);
        match state.events.get_mut(&id) {
            Some(event) => {
                let mut parts = event.to_parts();
                parts.next_attempt_at = Some(Utc::now());
                *event = NotificationEvent::from_parts(parts);
                true
            }
            None => false,
        }
    }

    /// Whether a dispatcher holds an unexpired lease on `id`.
    #[must_use]
    pub fn is_claimed(&self, id: EventId) -> bool {
        lock(&self.state).is_claimed(id, Utc::now())
    }

    /// Number of `save` calls that succeeded.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent `save` fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn save(&self, event: &NotificationEvent) -> Result<NotificationEvent, DeliveryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(DeliveryError::Repository("save rejected".to_string()));
        }
        let mut state = lock(&self.state);
        state.claims.remove(&event.id());
        state.events.insert(event.id(), event.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(event.clone())
    }

    async fn claim_for_dispatch(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationEvent>, DeliveryError> {
        let lease = chrono::Duration::from_std(self.claim_lease)
            .map_err(|e| DeliveryError::Repository(format!("Invalid claim lease: {e}")))?;

        let mut state = lock(&self.state);
        let claimable = match state.events.get(&id) {
            Some(event) => is_due(event, now) && !state.is_claimed(id, now),
            None => false,
        };
        if !claimable {
            return Ok(None);
        }
        state.claims.insert(id, now + lease);
        Ok(state.events.get(&id).cloned())
    }

    async fn find_by_id(&self, id: EventId) -> Result<Option<NotificationEvent>, DeliveryError> {
        Ok(self.get(id))
    }

    async fn find_by_id_and_owner(
        &self,
        id: EventId,
        client_id: &str,
    ) -> Result<Option<NotificationEvent>, DeliveryError> {
        Ok(self.get(id).filter(|e| e.client_id() == client_id))
    }

    async fn find_due_for_retry(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, DeliveryError> {
        let now = Utc::now();
        let state = lock(&self.state);
        let mut due: Vec<NotificationEvent> = state
            .events
            .values()
            .filter(|e| is_due(e, threshold) && !state.is_claimed(e.id(), now))
            .cloned()
            .collect();
        due.sort_by_key(NotificationEvent::next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_owner(
        &self,
        client_id: &str,
        filter: &EventFilter,
        page: PageRequest,
    ) -> Result<Page<NotificationEvent>, DeliveryError> {
        let mut matching: Vec<NotificationEvent> = lock(&self.state)
            .events
            .values()
            .filter(|e| e.client_id() == client_id && filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at().cmp(&a.created_at()));

        let total = matching.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page.size() as usize)
            .collect();

        Ok(Page::new(items, page, total))
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: Mutex<Vec<WebhookSubscription>>,
    fail_lookups: AtomicBool,
}

impl InMemorySubscriptionRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: WebhookSubscription) {
        lock(&self.subscriptions).push(subscription);
    }

    /// Make every subsequent lookup fail with a repository error.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn find_active(
        &self,
        client_id: &str,
        event_type: &str,
    ) -> Result<Option<WebhookSubscription>, DeliveryError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DeliveryError::Repository("lookup rejected".to_string()));
        }
        Ok(lock(&self.subscriptions)
            .iter()
            .find(|s| s.is_active_for(client_id, event_type))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Scripted reply of [`MockWebhookTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16),
    Error(String),
}

/// A request seen by [`MockWebhookTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub payload: Vec<u8>,
    pub headers: WebhookHeaders,
}

/// Transport that replays scripted replies and records every request.
///
/// Once the script is exhausted the default status is returned.
pub struct MockWebhookTransport {
    script: Mutex<VecDeque<MockReply>>,
    default_status: u16,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockWebhookTransport {
    /// Transport that answers every request with `status`.
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_status: status,
            delay: None,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering each request.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue replies answered before falling back to the default.
    #[must_use]
    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        lock(&self.script).extend(replies);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        lock(&self.script).push_back(reply);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Highest number of concurrently running `post` calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockWebhookTransport {
    fn default() -> Self {
        Self::with_status(200)
    }
}

#[async_trait]
impl WebhookTransport for MockWebhookTransport {
    async fn post(
        &self,
        url: &str,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookResponse, DeliveryError> {
        lock(&self.requests).push(RecordedRequest {
            url: url.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = lock(&self.script).pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply.unwrap_or(MockReply::Status(self.default_status)) {
            MockReply::Status(code) => Ok(WebhookResponse::from_status(code, None)),
            MockReply::Error(message) => Err(DeliveryError::Transport(message)),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry scheduling
// ---------------------------------------------------------------------------

/// Scheduler that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingRetryScheduler {
    scheduled: Mutex<Vec<(EventId, Duration)>>,
}

impl RecordingRetryScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scheduled(&self) -> Vec<(EventId, Duration)> {
        lock(&self.scheduled).clone()
    }
}

#[async_trait]
impl RetryScheduler for RecordingRetryScheduler {
    async fn schedule_retry(&self, event_id: EventId, delay: Duration) {
        lock(&self.scheduled).push((event_id, delay));
    }
}
