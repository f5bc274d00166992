use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota};
use reqwest::Url;

/// NCBI allows three requests per second without an API key.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(334);

/// Per-host minimum spacing between request starts, one token per `min_interval`.
pub struct RateLimiter {
    hosts: Option<DefaultKeyedRateLimiter<String>>,
}

impl RateLimiter {
    /// A zero interval disables limiting.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            hosts: Quota::with_period(min_interval).map(governor::RateLimiter::keyed),
        }
    }

    fn host_key(url: &Url) -> String {
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    }

    pub async fn wait_for_url(&self, url: &Url) {
        if let Some(hosts) = &self.hosts {
            hosts.until_key_ready(&Self::host_key(url)).await;
        }
    }

    pub async fn wait_for_url_str(&self, url: &str) {
        let Some(hosts) = &self.hosts else {
            return;
        };
        let key = Url::parse(url)
            .map(|url| Self::host_key(&url))
            .unwrap_or_default();
        hosts.until_key_ready(&key).await;
    }

    #[cfg(test)]
    fn try_acquire(&self, host: &str) -> bool {
        self.hosts
            .as_ref()
            .is_none_or(|hosts| hosts.check_key(&host.to_string()).is_ok())
    }
}
