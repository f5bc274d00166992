//! Upstream service clients and the shared HTTP plumbing they sit on.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CitegraphError;

pub mod eutils;
pub mod pubtator;
pub mod rate_limit;

use rate_limit::RateLimiter;

const USER_AGENT: &str = concat!("citegraph/", env!("CARGO_PKG_VERSION"));
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const EXCERPT_CHARS: usize = 200;

/// Resolve a service base URL, preferring the environment override when set.
pub(crate) fn env_base(default: &'static str, env_var: &str) -> Cow<'static, str> {
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Cow::Owned(value.trim().to_string()),
        _ => Cow::Borrowed(default),
    }
}

/// Environment override, then the configured value, then the built-in default.
pub(crate) fn configured_base(
    configured: Option<&str>,
    default: &'static str,
    env_var: &str,
) -> Cow<'static, str> {
    let env = env_base(default, env_var);
    if matches!(env, Cow::Owned(_)) {
        return env;
    }
    match configured.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => Cow::Owned(value.to_string()),
        None => env,
    }
}

pub(crate) fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn body_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{cut}…")
}

pub(crate) async fn read_limited_body(
    mut resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, CitegraphError> {
    let mut out = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if out.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(CitegraphError::Api {
                api: api.to_string(),
                message: format!("Response body exceeds {MAX_BODY_BYTES} bytes"),
            });
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Plain client for upstream literature services. No middleware: the fetcher makes
/// exactly one attempt and callers own the retry loop.
pub(crate) fn streaming_http_client(timeout: Duration) -> Result<reqwest::Client, CitegraphError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(USER_AGENT)
        .gzip(true)
        .build()
        .map_err(CitegraphError::HttpClientInit)
}

/// Client with transient-error retries, used for the graph store.
pub(crate) fn middleware_client(
    timeout: Duration,
    max_retries: u32,
) -> Result<reqwest_middleware::ClientWithMiddleware, CitegraphError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(CitegraphError::HttpClientInit)?;
    let policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
    Ok(reqwest_middleware::ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(policy))
        .build())
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

pub(crate) async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), CitegraphError> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(CitegraphError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(CitegraphError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `attempt` until it yields a value, the policy is exhausted, or `cancel` fires.
pub async fn retry_until_some<T, F, Fut>(
    api: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, CitegraphError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    for n in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(CitegraphError::Cancelled);
        }
        if let Some(value) = attempt().await {
            if n > 1 {
                debug!(api, attempts = n, "request succeeded after retry");
            }
            return Ok(value);
        }
        if n == max_attempts {
            break;
        }
        let delay = policy.delay_after(n);
        warn!(
            api,
            attempt = n,
            delay_ms = delay.as_millis() as u64,
            "request failed, backing off"
        );
        sleep_or_cancel(delay, cancel).await?;
    }
    Err(CitegraphError::RetriesExhausted {
        api: api.to_string(),
        attempts: max_attempts,
    })
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Settings for a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub delay: Duration,
    pub timeout: Duration,
    pub min_host_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(350),
            timeout: Duration::from_secs(20),
            min_host_interval: rate_limit::DEFAULT_MIN_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Rate-limited single-attempt fetcher shared by the upstream clients.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    delay: Duration,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(settings: &FetchSettings, cancel: CancellationToken) -> Result<Self, CitegraphError> {
        Ok(Self {
            client: streaming_http_client(settings.timeout)?,
            delay: settings.delay,
            timeout: settings.timeout,
            retry: settings.retry,
            limiter: Arc::new(RateLimiter::new(settings.min_host_interval)),
            cancel,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let settings = FetchSettings {
            delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
            min_host_interval: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        };
        Self::new(&settings, CancellationToken::new()).expect("test fetcher")
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// One GET attempt. Network, timeout and connection failures become `None`;
    /// a response of any status is returned after the configured delay.
    pub async fn fetch(&self, req: reqwest::RequestBuilder) -> Option<reqwest::Response> {
        let req = req.timeout(self.timeout);
        let request = match req.build() {
            Ok(request) => request,
            Err(err) => {
                warn!("could not build request: {err}");
                return None;
            }
        };
        self.limiter.wait_for_url(request.url()).await;
        let url = request.url().clone();
        match self.client.execute(request).await {
            Ok(resp) => {
                // Either branch returns the response; cancellation only cuts the delay short.
                let _ = sleep_or_cancel(self.delay, &self.cancel).await;
                Some(resp)
            }
            Err(err) => {
                let reason = if err.is_timeout() {
                    "timeout"
                } else if err.is_connect() {
                    "connect"
                } else {
                    "network"
                };
                warn!(url = %url, reason, "request failed: {err}");
                None
            }
        }
    }

    /// GET with bounded retries; transient statuses and truncated bodies are retried.
    pub async fn get_bytes<F>(&self, api: &str, build: F) -> Result<Vec<u8>, CitegraphError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let outcome = retry_until_some(api, &self.retry, &self.cancel, || async {
            let resp = self.fetch(build()).await?;
            let status = resp.status();
            if is_transient_status(status) {
                warn!(api, status = status.as_u16(), "transient HTTP status");
                return None;
            }
            match read_limited_body(resp, api).await {
                Ok(bytes) => Some(Ok((status, bytes))),
                Err(CitegraphError::Http(err)) => {
                    warn!(api, "body read failed: {err}");
                    None
                }
                Err(err) => Some(Err(err)),
            }
        })
        .await?;
        let (status, bytes) = outcome?;
        if !status.is_success() {
            return Err(CitegraphError::Api {
                api: api.to_string(),
                message: format!("HTTP {status}: {}", body_excerpt(&bytes)),
            });
        }
        Ok(bytes)
    }

    pub async fn get_text<F>(&self, api: &str, build: F) -> Result<String, CitegraphError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let bytes = self.get_bytes(api, build).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn get_json<T, F>(&self, api: &str, build: F) -> Result<T, CitegraphError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let bytes = self.get_bytes(api, build).await?;
        serde_json::from_slice(&bytes).map_err(|source| CitegraphError::ApiJson {
            api: api.to_string(),
            source,
        })
    }
}
