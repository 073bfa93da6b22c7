//! Throttled blocking HTTP client, one instance per upstream source.
//!
//! Pacing: a governor quota spaces request starts by `request_delay`
//! (sources that want jitter instead sleep a randomized fraction of the
//! delay before sending). Concurrency is bounded by the source's rayon
//! pool — a pool thread is a permit — so `pool size × this client's
//! pacing` gives the sustained request rate against one upstream.
//!
//! Retries: bounded attempts with exponential backoff on transport
//! errors, 429 (honoring `Retry-After`, capped) and 5xx. 404 is not an
//! error to retry — it is an answer.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use governor::{Jitter, Quota, RateLimiter};
use rand::Rng;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum FetchError {
    /// Upstream 404 — expected outcome, never retried.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error after {retries} retries: {message}")]
    Transport { retries: u32, message: String },
    #[error("rate limited after {0} retries")]
    RateLimited(u32),
    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },
    #[error("unreadable response body: {0}")]
    Body(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Per-source client tuning. `jittered` selects randomized pre-request
/// sleeps (50%–150% of the delay) instead of fixed governor pacing.
pub struct HttpSettings {
    pub base_url: String,
    pub headers: Vec<(&'static str, String)>,
    pub request_delay: Duration,
    pub jittered: bool,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl HttpSettings {
    pub fn new(base_url: &str, request_delay: Duration) -> Self {
        Self {
            base_url: base_url.to_string(),
            headers: Vec::new(),
            request_delay,
            jittered: false,
            max_retries: 3,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

pub struct HttpClient {
    agent: ureq::Agent,
    settings: HttpSettings,
    limiter: Option<governor::DefaultDirectRateLimiter>,
}

impl HttpClient {
    pub fn new(settings: HttpSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(settings.connect_timeout))
            .timeout_recv_response(Some(settings.read_timeout))
            .timeout_recv_body(Some(settings.read_timeout))
            .http_status_as_error(false)
            .build();

        let limiter = if settings.jittered {
            None
        } else {
            Quota::with_period(settings.request_delay).map(RateLimiter::direct)
        };

        Self {
            agent: config.into(),
            settings,
            limiter,
        }
    }

    fn absolute(&self, url: &str) -> String {
        if Url::parse(url).is_ok() {
            url.to_string()
        } else {
            format!("{}{}", self.settings.base_url, url)
        }
    }

    /// Space this request out from the previous ones.
    fn pace(&self, attempt: u32) {
        if let Some(limiter) = &self.limiter {
            while limiter.check().is_err() {
                thread::sleep(Jitter::up_to(Duration::from_millis(30)) + Duration::from_millis(20));
            }
        } else {
            let mut rng = rand::rng();
            let mut delay = self.settings.request_delay.mul_f64(rng.random_range(0.5..1.5));
            if attempt > 0 {
                delay += Duration::from_secs_f64(rng.random_range(2.0..8.0));
            }
            thread::sleep(delay);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        if self.settings.jittered {
            Duration::from_secs_f64(rand::rng().random_range(3.0..10.0))
        } else {
            Duration::from_secs(2u64.pow(attempt + 1))
        }
    }

    fn retry_after(&self, response: &ureq::http::Response<ureq::Body>, attempt: u32) -> Duration {
        let server = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        server
            .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt + 2)))
            .min(RETRY_AFTER_CAP)
    }

    /// Send a GET, retrying transient failures. Returns the response only
    /// on a 200.
    pub fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<ureq::http::Response<ureq::Body>, FetchError> {
        let url = self.absolute(url);
        let retries = self.settings.max_retries.max(1);
        let mut last_status = 0;

        for attempt in 0..retries {
            self.pace(attempt);

            let mut request = self.agent.get(&url);
            for (name, value) in &self.settings.headers {
                request = request.header(*name, value.as_str());
            }
            for (name, value) in params {
                request = request.query(*name, *value);
            }

            let response = match request.call() {
                Ok(response) => response,
                Err(e) => {
                    if attempt + 1 < retries {
                        thread::sleep(self.backoff(attempt));
                        continue;
                    }
                    return Err(FetchError::Transport {
                        retries,
                        message: e.to_string(),
                    });
                }
            };

            let status = response.status().as_u16();
            match status {
                200 => return Ok(response),
                404 => return Err(FetchError::NotFound(url)),
                429 => {
                    let wait = self.retry_after(&response, attempt);
                    if attempt + 1 < retries {
                        debug!(url, attempt, wait = ?wait, "429 rate-limited, backing off");
                        thread::sleep(wait);
                        continue;
                    }
                    return Err(FetchError::RateLimited(retries));
                }
                other => {
                    last_status = other;
                    if attempt + 1 < retries {
                        debug!(url, status = other, attempt, "retrying after HTTP error");
                        thread::sleep(self.backoff(attempt));
                        continue;
                    }
                }
            }
        }

        Err(FetchError::Status {
            status: last_status,
            url,
        })
    }

    pub fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut response = self.get(url, &[])?;
        response
            .body_mut()
            .read_to_string()
            .map_err(|e| FetchError::Body(e.to_string()))
    }

    pub fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let mut response = self.get(url, &[])?;
        response
            .body_mut()
            .with_config()
            .limit(64 * 1024 * 1024)
            .read_to_vec()
            .map(Bytes::from)
            .map_err(|e| FetchError::Body(e.to_string()))
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let mut response = self.get(url, params)?;
        response
            .body_mut()
            .read_json()
            .map_err(|e| FetchError::Body(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn relative_urls_join_the_base() {
        let client = HttpClient::new(HttpSettings::new(
            "https://example.com",
            Duration::from_millis(1),
        ));
        assert_eq!(client.absolute("/path"), "https://example.com/path");
        assert_eq!(client.absolute("https://other.com/x"), "https://other.com/x");
    }

    #[test]
    fn pacing_spaces_consecutive_requests() {
        let client = HttpClient::new(HttpSettings::new(
            "https://example.com",
            Duration::from_millis(40),
        ));
        let start = Instant::now();
        client.pace(0);
        client.pace(0);
        client.pace(0);
        // first passes immediately, the next two wait out the period
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn jittered_pacing_stays_within_bounds() {
        let mut settings = HttpSettings::new("https://example.com", Duration::from_millis(20));
        settings.jittered = true;
        let client = HttpClient::new(settings);
        let start = Instant::now();
        client.pace(0);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn backoff_grows_exponentially_when_fixed() {
        let client = HttpClient::new(HttpSettings::new(
            "https://example.com",
            Duration::from_millis(1),
        ));
        assert_eq!(client.backoff(0), Duration::from_secs(2));
        assert_eq!(client.backoff(1), Duration::from_secs(4));
        assert_eq!(client.backoff(2), Duration::from_secs(8));
    }
}
