//! Raw send primitive plus the retry/backoff wrapper around it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::method::HttpMethod;
use crate::engine::cancel::{ensure_active, wait_or_cancel};
use crate::error::{CheckError, CheckResult, TransportErrorKind};

/// A fully built request ready to hit the wire. The body is held as
/// [`Bytes`] so every attempt re-sends the same content.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Replaces any existing header of the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_ascii_lowercase()
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The single-attempt send primitive the retry layer wraps.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportFailure>;
}

pub fn build_headers(input: &[(String, String)]) -> CheckResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
            CheckError::RequestConstruction(format!("Invalid header name `{key}`: {err}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            CheckError::RequestConstruction(format!("Invalid header value for `{key}`: {err}"))
        })?;
        headers.append(header_name, header_value);
    }

    Ok(headers)
}

/// Non-UTF-8 bytes are replaced rather than dropping the value.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(key, value)| (key.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect()
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    let message = err.to_string().to_ascii_lowercase();
    if message.contains("dns") || message.contains("failed to lookup address") {
        return TransportErrorKind::Dns;
    }
    if message.contains("tls") || message.contains("ssl") || message.contains("certificate") {
        return TransportErrorKind::Tls;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }
    if err.is_body() || err.is_decode() {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// [`Sender`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    pub fn new(timeout: Option<Duration>) -> CheckResult<Self> {
        let mut builder = Client::builder().redirect(reqwest::redirect::Policy::limited(10));
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|err| CheckError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sender for ReqwestSender {
    async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportFailure> {
        let headers = build_headers(&request.headers)
            .map_err(|err| TransportFailure::new(TransportErrorKind::Other, err.to_string()))?;

        let mut builder = self
            .client
            .request(request.method.into(), request.url.clone())
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportFailure::new(classify_reqwest_error(&err), err.to_string()))?;

        let status = response.status();
        let response_headers = header_pairs(response.headers());

        let body = response.bytes().await.map_err(|err| {
            TransportFailure::new(TransportErrorKind::Read, format!("Failed to read response: {err}"))
        })?;

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers: response_headers,
            body,
        })
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_retryable_statuses() -> BTreeSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_errors() -> BTreeSet<TransportErrorKind> {
    [TransportErrorKind::Timeout, TransportErrorKind::Connect]
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Fraction in `0..=1` by which each delay is randomly scaled.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: BTreeSet<u16>,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: BTreeSet<TransportErrorKind>,
    /// When set, POST and PATCH are never retried.
    #[serde(default)]
    pub idempotent_only: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            retryable_statuses: default_retryable_statuses(),
            retryable_errors: default_retryable_errors(),
            idempotent_only: false,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CheckResult<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CheckError::Config(format!(
                "Retry jitter must be within 0..=1, got {}",
                self.jitter
            )));
        }
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(CheckError::Config(format!(
                "Retry backoff factor must be >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(CheckError::Config(
                "Retry initial backoff exceeds max backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt + 1`, without jitter:
    /// `min(max, initial * factor^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max_ms = self.max_backoff_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_secs_f64(capped.max(0.0) / 1000.0)
    }

    /// Scales `base` by `factor`, clamped into `[1 - jitter, 1 + jitter]`.
    pub fn apply_jitter(&self, base: Duration, factor: f64) -> Duration {
        let low = 1.0 - self.jitter;
        let high = 1.0 + self.jitter;
        base.mul_f64(factor.clamp(low, high).max(0.0))
    }

    pub fn should_retry(
        &self,
        method: HttpMethod,
        outcome: &Result<RawResponse, TransportFailure>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> bool {
        if attempt >= self.max_retries || cancel.is_cancelled() {
            return false;
        }
        if self.idempotent_only && !method.is_idempotent() {
            return false;
        }

        match outcome {
            Err(failure) => {
                failure.kind.is_transient() || self.retryable_errors.contains(&failure.kind)
            }
            Ok(response) => self.retryable_statuses.contains(&response.status),
        }
    }
}

/// What the transport hands back after the final attempt.
#[derive(Debug, Clone)]
pub struct TransportOutcome {
    pub response: RawResponse,
    pub attempts: u32,
}

pub struct RetryingTransport {
    sender: Arc<dyn Sender>,
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl RetryingTransport {
    pub fn new(sender: Arc<dyn Sender>, policy: RetryPolicy) -> Self {
        Self {
            sender,
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic jitter, for tests and replays.
    pub fn with_seed(sender: Arc<dyn Sender>, policy: RetryPolicy, seed: u64) -> Self {
        Self {
            sender,
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sender(&self) -> Arc<dyn Sender> {
        self.sender.clone()
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.backoff(attempt);
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let factor = self
            .rng
            .lock()
            .gen_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
        self.policy.apply_jitter(base, factor)
    }

    /// Sends `request`, retrying per policy. A response with a retryable
    /// status that survives every attempt is still returned as a response;
    /// only a send failure on the last attempt becomes an error.
    pub async fn send(
        &self,
        request: &OutboundRequest,
        cancel: &CancellationToken,
    ) -> CheckResult<TransportOutcome> {
        let mut attempt: u32 = 0;

        loop {
            ensure_active(cancel)?;

            let outcome = self.sender.send(request).await;
            match &outcome {
                Ok(response) => debug!(
                    method = %request.method,
                    url = %request.url,
                    attempt,
                    status = response.status,
                    "attempt completed"
                ),
                Err(failure) => debug!(
                    method = %request.method,
                    url = %request.url,
                    attempt,
                    kind = %failure.kind,
                    error = %failure.message,
                    "attempt failed"
                ),
            }

            if !self.policy.should_retry(request.method, &outcome, attempt, cancel) {
                return match outcome {
                    Ok(response) => Ok(TransportOutcome {
                        response,
                        attempts: attempt + 1,
                    }),
                    Err(failure) => {
                        ensure_active(cancel)?;
                        Err(CheckError::Transport {
                            kind: failure.kind,
                            message: failure.message,
                            attempts: attempt + 1,
                        })
                    }
                };
            }

            let delay = self.jittered_delay(attempt);
            warn!(
                method = %request.method,
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            wait_or_cancel(delay, cancel).await?;
            attempt += 1;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{failure, raw, FakeSender};
    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn request(method: HttpMethod) -> OutboundRequest {
        OutboundRequest::new(method, Url::parse("http://localhost/x").unwrap())
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let current = policy.backoff(attempt);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..RetryPolicy::default()
        };
        let transport =
            RetryingTransport::with_seed(Arc::new(FakeSender::scripted([])), policy.clone(), 7);
        for attempt in 0..8 {
            let base = policy.backoff(attempt);
            let delay = transport.jittered_delay(attempt);
            assert!(delay >= base.mul_f64(0.75) && delay <= base.mul_f64(1.25));
        }
        assert_eq!(policy.apply_jitter(Duration::from_secs(1), 9.0), Duration::from_millis(1250));
    }

    #[test]
    fn should_retry_rules() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        assert!(policy.should_retry(HttpMethod::Get, &Ok(raw(503, "text/plain", "")), 0, &cancel));
        assert!(!policy.should_retry(HttpMethod::Get, &Ok(raw(404, "text/plain", "")), 0, &cancel));
        assert!(policy.should_retry(HttpMethod::Get, &failure(TransportErrorKind::Timeout), 0, &cancel));
        assert!(!policy.should_retry(HttpMethod::Get, &failure(TransportErrorKind::Tls), 0, &cancel));
        assert!(!policy.should_retry(HttpMethod::Get, &failure(TransportErrorKind::Timeout), 3, &cancel));
        assert!(policy.should_retry(HttpMethod::Post, &Ok(raw(503, "text/plain", "")), 0, &cancel));

        cancel.cancel();
        assert!(!policy.should_retry(HttpMethod::Get, &failure(TransportErrorKind::Timeout), 0, &cancel));
    }

    #[test]
    fn idempotent_only_blocks_post_retries() {
        let policy = RetryPolicy {
            idempotent_only: true,
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        let outcome = Ok(raw(503, "text/plain", ""));
        assert!(!policy.should_retry(HttpMethod::Post, &outcome, 0, &cancel));
        assert!(policy.should_retry(HttpMethod::Put, &outcome, 0, &cancel));
    }

    #[test]
    fn configured_error_classes_are_retryable() {
        let mut policy = RetryPolicy::default();
        policy.retryable_errors.insert(TransportErrorKind::Read);
        let cancel = CancellationToken::new();
        assert!(policy.should_retry(HttpMethod::Get, &failure(TransportErrorKind::Read), 0, &cancel));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let sender = Arc::new(FakeSender::scripted([
            Ok(raw(503, "text/plain", "busy")),
            failure(TransportErrorKind::Connect),
            Ok(raw(200, "text/plain", "ok")),
        ]));
        let transport = RetryingTransport::new(sender.clone(), fast_policy(3));

        let outcome = transport
            .send(&request(HttpMethod::Get), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.status, 200);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(sender.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_status_retries_return_last_response() {
        let sender = Arc::new(FakeSender::routing(|_| Ok(raw(503, "text/plain", "busy"))));
        let transport = RetryingTransport::new(sender.clone(), fast_policy(2));

        let outcome = transport
            .send(&request(HttpMethod::Get), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.status, 503);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_errors_surface_attempt_count() {
        let sender = Arc::new(FakeSender::routing(|_| failure(TransportErrorKind::Timeout)));
        let transport = RetryingTransport::new(sender, fast_policy(2));

        let err = transport
            .send(&request(HttpMethod::Get), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CheckError::Transport { kind, attempts, .. } => {
                assert_eq!(kind, TransportErrorKind::Timeout);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let sender = Arc::new(FakeSender::routing(|_| failure(TransportErrorKind::Dns)));
        let transport = RetryingTransport::new(sender.clone(), fast_policy(5));

        let err = transport
            .send(&request(HttpMethod::Get), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Transport { attempts: 1, .. }));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts() {
        let sender = Arc::new(FakeSender::routing(|_| Ok(raw(503, "text/plain", ""))));
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 20_000,
            max_backoff_ms: 20_000,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let transport = RetryingTransport::new(sender.clone(), policy);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = transport.send(&request(HttpMethod::Get), &cancel).await.unwrap_err();
        assert!(matches!(err, CheckError::Cancelled));
        assert_eq!(sender.calls(), 1);
    }

    #[test]
    fn non_ascii_response_headers_keep_their_text() {
        let mut headers = HeaderMap::new();
        headers.insert("x-city", reqwest::header::HeaderValue::from_bytes("Zürich".as_bytes()).unwrap());
        headers.insert("x-plain", reqwest::header::HeaderValue::from_static("ok"));

        let pairs = header_pairs(&headers);
        assert!(pairs.contains(&("x-city".to_string(), "Zürich".to_string())));
        assert!(pairs.contains(&("x-plain".to_string(), "ok".to_string())));
    }

    #[test]
    fn validate_rejects_bad_jitter() {
        let policy = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(CheckError::Config(_))));
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
