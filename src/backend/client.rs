use crate::backend::{BackendError, RetryPolicy};
use crate::config::DatabaseServiceSettings;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Longest backend error text passed through to clients.
const MAX_ERROR_TEXT: usize = 500;

/// HTTP client for the database REST service.
///
/// Every call carries the configured timeout. Connection failures and 5xx
/// answers are retried according to the [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct DatabaseClient {
    http: Client,
    base_url: Url,
    timeout: Duration,
    retry: RetryPolicy,
}

impl DatabaseClient {
    pub fn new(settings: &DatabaseServiceSettings) -> Result<Self, BackendError> {
        let base_url =
            Url::parse(&settings.url).map_err(|e| BackendError::InvalidUrl(format!("{}: {}", settings.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(settings.url.clone()));
        }

        let timeout = Duration::from_secs(settings.timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            timeout,
            retry: RetryPolicy::new(settings),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub async fn get(&self, path: &[&str], query: &[(&str, String)]) -> Result<Value, BackendError> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &[&str], body: &Value) -> Result<Value, BackendError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put(&self, path: &[&str], body: &Value) -> Result<Value, BackendError> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn delete(&self, path: &[&str]) -> Result<Value, BackendError> {
        self.request(Method::DELETE, path, &[], None).await
    }

    /// Build the URL for `path`. Each segment is percent-encoded on its own,
    /// so a `/` inside a table name cannot change the route.
    pub fn endpoint(&self, path: &[&str], query: &[(&str, String)]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(path);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = self.endpoint(path, query)?;
        let mut attempt = 1;

        loop {
            match self.send_once(method.clone(), url.clone(), body).await {
                Ok(value) => return Ok(value),
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Database service call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Database service call failed");
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, BackendError> {
        debug!(method = %method, url = %url, "Calling database service");

        let mut request = self.http.request(method, url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, self.timeout))?;

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;

        if value.get("success") == Some(&Value::Bool(false)) {
            return Err(BackendError::Rejected(error_message(&text)));
        }

        Ok(value)
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["detail", "message", "error"]
            .iter()
            .find_map(|key| match v.get(*key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
    });

    let mut message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        message = "no details".to_string();
    }
    if message.len() > MAX_ERROR_TEXT {
        let mut cut = MAX_ERROR_TEXT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}
