use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::SteamEndpoints;
use crate::error::FetchError;
use crate::models::{AppId, ItemDetail};

/// One appdetails request. `Ok(None)` means the store has nothing usable for
/// the id; that is final and never retried.
#[async_trait]
pub trait DetailTransport: Send + Sync {
    async fn attempt(&self, appid: AppId) -> Result<Option<ItemDetail>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct AppDetailsWrapper {
    #[serde(default)]
    success: bool,
    data: Option<AppData>,
}

#[derive(Debug, Deserialize)]
struct AppData {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    header_image: Option<String>,
    #[serde(default)]
    recommendations: Option<Recommendations>,
    #[serde(default)]
    supported_languages: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Recommendations {
    total: Option<i64>,
}

/// Pick the entry for `appid` out of an appdetails body.
///
/// Anything short of `{"<appid>": {"success": true, "data": {...}}}` is treated
/// as "no data" rather than an error: the store answers that way for delisted
/// and region-locked ids.
pub fn parse_app_details(appid: AppId, body: &Value) -> Option<ItemDetail> {
    let entry = body.as_object()?.get(&appid.to_string())?;
    let wrapper: AppDetailsWrapper = match serde_json::from_value(entry.clone()) {
        Ok(w) => w,
        Err(err) => {
            debug!(appid, error = %err, "appdetails entry did not decode; treating as absent");
            return None;
        }
    };
    if !wrapper.success {
        return None;
    }
    let data = wrapper.data?;
    Some(ItemDetail {
        id: appid,
        kind: data.kind.unwrap_or_default(),
        name: data.name.filter(|n| !n.trim().is_empty()),
        short_description: data.short_description.unwrap_or_default(),
        image_url: data.header_image.unwrap_or_default(),
        popularity_count: data
            .recommendations
            .and_then(|r| r.total)
            .unwrap_or(0)
            .max(0),
        raw_language_support: data.supported_languages.unwrap_or_default(),
    })
}

/// Seconds form of `Retry-After`, capped at `ceiling`. HTTP-date values are
/// ignored and fall back to the policy's own cool-off.
pub fn parse_retry_after(raw: Option<&str>, ceiling: Duration) -> Option<Duration> {
    let secs = raw?.trim().parse::<u64>().ok()?;
    let wait = Duration::from_secs(secs);
    if wait > ceiling {
        warn!(
            retry_after_secs = secs,
            ceiling_secs = ceiling.as_secs(),
            "Retry-After above ceiling; clamping"
        );
        return Some(ceiling);
    }
    Some(wait)
}

pub struct SteamDetailClient {
    client: Client,
    store_base: String,
    language: String,
    max_retry_after: Duration,
}

impl SteamDetailClient {
    /// `language` is sent as `l=` so text fields come back localized.
    pub fn new(client: Client, endpoints: &SteamEndpoints, language: impl Into<String>) -> Self {
        Self {
            client,
            store_base: endpoints.store_base().to_string(),
            language: language.into(),
            max_retry_after: endpoints.max_retry_after,
        }
    }
}

#[async_trait]
impl DetailTransport for SteamDetailClient {
    async fn attempt(&self, appid: AppId) -> Result<Option<ItemDetail>, FetchError> {
        let url = format!("{}/api/appdetails", self.store_base);
        let appid_param = appid.to_string();
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("appids", appid_param.as_str()), ("l", self.language.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok());
            let retry_after = parse_retry_after(header, self.max_retry_after);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = resp.bytes().await?;
        let value: Value = serde_json::from_slice(&body).map_err(FetchError::Malformed)?;
        Ok(parse_app_details(appid, &value))
    }
}

/// How transient failures of a detail request are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Single attempt; a failure cools off once and gives the id up.
    Immediate {
        cooldown: Duration,
        rate_limit_cooldown: Duration,
    },
    /// Up to `max_attempts`; the n-th failure waits `base_delay + step * (n - 1)`.
    Backoff {
        max_attempts: u32,
        base_delay: Duration,
        step: Duration,
        rate_limit_cooldown: Duration,
    },
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Immediate { .. } => 1,
            RetryPolicy::Backoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Pause after failed attempt `attempt` (1-based). A 429 never waits less
    /// than the rate-limit cool-off or the server's `Retry-After`.
    pub fn delay_after(&self, attempt: u32, err: &FetchError) -> Duration {
        let (base, rate_limit_cooldown) = match self {
            RetryPolicy::Immediate {
                cooldown,
                rate_limit_cooldown,
            } => (*cooldown, *rate_limit_cooldown),
            RetryPolicy::Backoff {
                base_delay,
                step,
                rate_limit_cooldown,
                ..
            } => (
                base_delay.saturating_add(step.saturating_mul(attempt.saturating_sub(1))),
                *rate_limit_cooldown,
            ),
        };
        if err.is_rate_limited() {
            base.max(rate_limit_cooldown)
                .max(err.retry_after().unwrap_or_default())
        } else {
            base
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            RetryPolicy::Immediate { .. } => "immediate",
            RetryPolicy::Backoff { .. } => "backoff",
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Backoff {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            step: Duration::from_secs(2),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

/// Mode names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    Immediate,
    Backoff,
}

impl FromStr for RetryMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "immediate" | "none" | "off" => Ok(RetryMode::Immediate),
            "backoff" | "retry" | "bounded" => Ok(RetryMode::Backoff),
            other => Err(format!(
                "unknown retry mode {other:?} (expected immediate | backoff)"
            )),
        }
    }
}

/// Result of a detail lookup after the retry policy has run its course.
#[derive(Debug)]
pub enum DetailLookup {
    Found(ItemDetail),
    /// The store has no data for this id; discard quietly.
    Absent,
    /// Every attempt failed transiently. The caller decides whether to ledger it.
    Exhausted { attempts: u32, last_error: FetchError },
}

pub struct DetailFetcher {
    transport: Arc<dyn DetailTransport>,
    policy: RetryPolicy,
}

impl DetailFetcher {
    pub fn new(transport: Arc<dyn DetailTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn fetch_detail(&self, appid: AppId) -> DetailLookup {
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.transport.attempt(appid).await {
                Ok(Some(detail)) => return DetailLookup::Found(detail),
                Ok(None) => return DetailLookup::Absent,
                Err(err) => err,
            };

            let delay = self.policy.delay_after(attempt, &err);
            if err.is_rate_limited() {
                warn!(
                    appid,
                    attempt,
                    max_attempts,
                    cooldown_ms = delay.as_millis() as u64,
                    "appdetails rate limited; cooling off"
                );
            } else {
                warn!(
                    appid,
                    attempt,
                    max_attempts,
                    error = %err,
                    "appdetails request failed"
                );
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if attempt >= max_attempts {
                return DetailLookup::Exhausted {
                    attempts: attempt,
                    last_error: err,
                };
            }
        }
    }
}
