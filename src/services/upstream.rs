//! Upstream station API client.
//!
//! Fetches raw samples from the station's HTTP API. The host is on-demand
//! hosted and may need to wake: the first request after an idle period
//! commonly fails fast with a connect error or a 5xx. Those failures are
//! classified `ColdStart` and retried on a short fixed delay; everything
//! else retryable follows the exponential backoff schedule. All failure
//! modes come back as values — nothing here escapes the ingest boundary as
//! a panic.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Classified upstream failure for one request.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out after {0} ms")]
    Timeout(u64),

    #[error("upstream cold start (status {status:?}, failed in {elapsed_ms} ms)")]
    ColdStart {
        /// HTTP status when the host answered at all; `None` for connect
        /// failures.
        status: Option<u16>,
        elapsed_ms: u64,
    },

    #[error("upstream returned HTTP {0}")]
    BadStatus(u16),

    #[error("upstream payload malformed: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Whether another attempt within the same cycle can change the outcome.
    /// 4xx statuses and malformed payloads cannot — the request itself is
    /// rejected, so they fail fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Timeout(_) | UpstreamError::ColdStart { .. } => true,
            UpstreamError::BadStatus(status) => *status >= 500,
            UpstreamError::Malformed(_) => false,
        }
    }
}

/// A fetch that exhausted its attempts (or hit a non-retryable failure).
#[derive(Debug, thiserror::Error)]
#[error("fetch failed after {attempts} attempt(s): {error}")]
pub struct FetchError {
    pub attempts: u32,
    #[source]
    pub error: UpstreamError,
}

/// Successful fetch plus the number of attempts it took.
#[derive(Debug)]
pub struct FetchReply {
    pub samples: Vec<RawSample>,
    pub attempts: u32,
}

/// One raw sample as the upstream sends it. Fields are optional here;
/// presence and ranges are the Normalizer's contract, not the wire's.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSample {
    /// Station-local naive timestamp, e.g. "2024-06-01T14:00:00".
    pub ts: Option<String>,
    pub temperature_c: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub wind_dir_deg: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StationResponse {
    samples: Vec<RawSample>,
}

/// Retry/backoff parameters. Fully configuration-driven so tests run on a
/// compressed schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per fetch, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fixed short delay before retrying a cold-start failure.
    pub cold_start_delay_ms: u64,
    /// A failure faster than this is a candidate cold start.
    pub cold_start_threshold_ms: u64,
    pub request_timeout_secs: u64,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based) that failed
    /// with `error`. Cold starts retry aggressively on the fixed short
    /// delay; everything else walks the capped exponential schedule.
    pub fn delay_after(&self, attempt: u32, error: &UpstreamError) -> Duration {
        if matches!(error, UpstreamError::ColdStart { .. }) {
            return Duration::from_millis(self.cold_start_delay_ms);
        }
        let exp = self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped + jitter_ms(attempt, self.base_delay_ms / 4 + 1))
    }
}

/// Deterministic jitter so retries from many deployments don't align on the
/// same instants. Seeded from the attempt counter, no RNG state to carry.
fn jitter_ms(attempt: u32, cap_ms: u64) -> u64 {
    (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % cap_ms.max(1)
}

/// Client for the upstream station API.
#[derive(Debug, Clone)]
pub struct StationClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    policy: RetryPolicy,
}

impl StationClient {
    pub fn new(base_url: &str, user_agent: &str, policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(policy.request_timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            policy,
        }
    }

    /// Fetch all samples newer than `since` for a station.
    ///
    /// Retries per the policy; the error case reports how many attempts were
    /// made so the cycle result can record them. Backoff state lives only
    /// within this call — the client is stateless across fetches.
    pub async fn fetch_samples(
        &self,
        station_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchReply, FetchError> {
        let mut url = format!("{}/api/stations/{}/samples", self.base_url, station_id);
        if let Some(since) = since {
            url.push_str(&format!(
                "?since={}",
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&url).await {
                Ok(samples) => {
                    return Ok(FetchReply {
                        samples,
                        attempts: attempt,
                    })
                }
                Err(error) => {
                    if attempt >= self.policy.max_attempts || !error.is_retryable() {
                        return Err(FetchError {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.policy.delay_after(attempt, &error);
                    tracing::warn!(
                        "upstream fetch attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        self.policy.max_attempts,
                        error,
                        delay,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, url: &str) -> Result<Vec<RawSample>, UpstreamError> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(UpstreamError::Timeout(self.policy.request_timeout_secs * 1000))
            }
            Err(_) if elapsed_ms < self.policy.cold_start_threshold_ms => {
                return Err(UpstreamError::ColdStart {
                    status: None,
                    elapsed_ms,
                })
            }
            Err(_) => return Err(UpstreamError::Timeout(elapsed_ms)),
        };

        let status = response.status();
        if status.is_server_error() {
            // a fast 5xx is the waking host, not a steady-state failure
            return Err(if elapsed_ms < self.policy.cold_start_threshold_ms {
                UpstreamError::ColdStart {
                    status: Some(status.as_u16()),
                    elapsed_ms,
                }
            } else {
                UpstreamError::BadStatus(status.as_u16())
            });
        }
        if !status.is_success() {
            return Err(UpstreamError::BadStatus(status.as_u16()));
        }

        let body: StationResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(body.samples)
    }
}
