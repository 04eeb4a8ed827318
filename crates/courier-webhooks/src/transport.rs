//! HTTP transport backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::error::DeliveryError;
use crate::ports::{WebhookHeaders, WebhookResponse, WebhookTransport, MAX_RESPONSE_BODY_CHARS};

/// Client-level request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "courier-webhooks/1.0";

/// Posts payloads with a shared `reqwest` client. Redirects are not followed.
#[derive(Debug, Clone)]
pub struct HttpWebhookTransport {
    client: Client,
}

impl HttpWebhookTransport {
    /// Build a transport with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transport` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, DeliveryError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Build a transport with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_header_map(headers: &WebhookHeaders) -> Result<HeaderMap, DeliveryError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.to_pairs() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeliveryError::Transport(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DeliveryError::Transport(format!("Invalid header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(
        &self,
        url: &str,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookResponse, DeliveryError> {
        let header_map = to_header_map(headers)?;

        let response = self
            .client
            .post(url)
            .headers(header_map)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Transport(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    DeliveryError::Transport(format!("Connection failed: {e}"))
                } else {
                    DeliveryError::Transport(format!("Request error: {e}"))
                }
            })?;

        let status_code = response.status().as_u16();
        let body = response
            .text()
            .await
            .ok()
            .map(|b| b.chars().take(MAX_RESPONSE_BODY_CHARS).collect::<String>())
            .filter(|b| !b.is_empty());

        Ok(WebhookResponse::from_status(status_code, body))
    }
}
