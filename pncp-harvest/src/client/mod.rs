//! Rate-governed client for the procurement consultation API
//!
//! The sole point of contact with the upstream service. Every call passes
//! through, in order:
//! 1. the circuit breaker (fail fast while open, single half-open probe)
//! 2. two quota limiters (per-minute and per-hour, at a safety margin
//!    below the published caps)
//! 3. an adaptive pressure delay that grows multiplicatively on 429s and
//!    decays after a sustained success window
//!
//! Transient failures (timeout, 5xx, 429) retry on the [`BackoffPolicy`]
//! schedule up to a bounded attempt count and feed the breaker; other 4xx
//! are permanent for the call and skip retry. HTTP 403 is fatal to the run.
//! Every attempt is accounted against the active stage's metrics.

pub mod backoff;
pub mod breaker;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use transport::{ApiRequest, HttpTransport, RawResponse, Transport, TransportError};

use crate::pipeline::metrics::MetricsHub;
use crate::types::{ItemDto, ItemListing, ItemResultDto, ListPage, ShortfallKind};
use governor::{Quota, RateLimiter};
use pncp_common::config::{HarvestConfig, QueryWindow};
use pncp_common::models::TenderKey;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

/// Typed outcome taxonomy for upstream calls
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transient failures (timeout, 5xx, 429) exhausted the retry budget
    #[error("transient failures exhausted {attempts} attempts, last: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Upstream rejected the call; retrying cannot help
    #[error("upstream rejected call: HTTP {status}")]
    Permanent { status: u16 },

    /// HTTP 403: possible access denial, all further calls must halt
    #[error("access denied by upstream (HTTP 403)")]
    AccessDenied,

    /// Breaker open: the call was never issued
    #[error("circuit breaker open, failing fast")]
    BreakerOpen,

    /// 2xx response whose body did not parse
    #[error("malformed response body: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Fatal errors end the run; everything else is containable locally
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::AccessDenied)
    }

    pub fn shortfall_kind(&self) -> ShortfallKind {
        match self {
            ClientError::RetriesExhausted { .. } => ShortfallKind::RetriesExhausted,
            ClientError::BreakerOpen => ShortfallKind::BreakerOpen,
            _ => ShortfallKind::Permanent,
        }
    }
}

/// Adaptive pressure under sustained 429s: the multiplier doubles on each
/// rate-limit response (so repeated pressure keeps reducing throughput) and
/// halves again after a window of consecutive successes.
#[derive(Debug)]
struct PressureState {
    success_streak: u32,
}

const PRESSURE_CAP: u32 = 16;
const PRESSURE_STEP_MS: u64 = 250;
const SUCCESS_WINDOW: u32 = 20;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub struct RateGovernedClient<T: Transport> {
    transport: T,
    /// Per-minute quota (at the configured margin below the published cap)
    minute_limiter: DirectRateLimiter,
    /// Per-hour quota (independent of the per-minute one)
    hour_limiter: DirectRateLimiter,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    multiplier: AtomicU32,
    pressure: Mutex<PressureState>,
    metrics: Arc<MetricsHub>,
    max_attempts: u32,
}

impl<T: Transport> RateGovernedClient<T> {
    pub fn new(transport: T, config: &HarvestConfig, metrics: Arc<MetricsHub>) -> Self {
        let per_minute =
            NonZeroU32::new(config.effective_per_minute()).expect("quota clamped to at least 1");
        let per_hour =
            NonZeroU32::new(config.effective_per_hour()).expect("quota clamped to at least 1");

        Self {
            transport,
            minute_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            hour_limiter: RateLimiter::direct(Quota::per_hour(per_hour)),
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
            backoff: BackoffPolicy::default(),
            multiplier: AtomicU32::new(1),
            pressure: Mutex::new(PressureState { success_streak: 0 }),
            metrics,
            max_attempts: config.retry_attempts.max(1),
        }
    }

    /// Override the retry schedule (tests use millisecond delays)
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Current adaptive backoff multiplier (1 = no extra pressure delay)
    pub fn backoff_multiplier(&self) -> u32 {
        self.multiplier.load(Ordering::Acquire)
    }

    fn note_rate_limited(&self) {
        let mut pressure = self.pressure.lock().expect("pressure lock poisoned");
        pressure.success_streak = 0;
        let current = self.multiplier.load(Ordering::Acquire);
        let next = (current * 2).min(PRESSURE_CAP);
        if next != current {
            self.multiplier.store(next, Ordering::Release);
            info!(multiplier = next, "Upstream pressure: backoff multiplier increased");
        }
    }

    fn note_success(&self) {
        let mut pressure = self.pressure.lock().expect("pressure lock poisoned");
        pressure.success_streak += 1;
        if pressure.success_streak >= SUCCESS_WINDOW {
            pressure.success_streak = 0;
            let current = self.multiplier.load(Ordering::Acquire);
            if current > 1 {
                self.multiplier.store(current / 2, Ordering::Release);
                info!(
                    multiplier = current / 2,
                    "Sustained success: backoff multiplier relaxed"
                );
            }
        }
    }

    async fn pressure_delay(&self) {
        let multiplier = self.multiplier.load(Ordering::Acquire);
        if multiplier > 1 {
            let extra = std::time::Duration::from_millis(PRESSURE_STEP_MS * (multiplier - 1) as u64);
            tokio::time::sleep(extra).await;
        }
    }

    /// Issue one governed call, retrying transient failures.
    ///
    /// Returns the raw 2xx response; the typed endpoint wrappers below
    /// interpret bodies and 404s.
    pub async fn call(&self, req: ApiRequest) -> Result<RawResponse, ClientError> {
        let mut attempt = 0u32;

        loop {
            if !self.breaker.allow_request() {
                self.metrics.record_failure();
                return Err(ClientError::BreakerOpen);
            }

            attempt += 1;
            self.minute_limiter.until_ready().await;
            self.hour_limiter.until_ready().await;
            self.pressure_delay().await;
            self.metrics.record_call();

            let failure: String = match self.transport.send(req.clone()).await {
                Ok(resp) => match resp.status {
                    200..=299 => {
                        self.breaker.record_success();
                        self.note_success();
                        return Ok(resp);
                    }
                    403 => {
                        self.metrics.record_failure();
                        error!(path = %req.path, "Upstream returned 403, halting all further calls");
                        return Err(ClientError::AccessDenied);
                    }
                    429 => {
                        self.metrics.record_failure();
                        self.breaker.record_failure();
                        self.note_rate_limited();
                        warn!(path = %req.path, attempt, "Rate limited by upstream (429)");
                        "HTTP 429".to_string()
                    }
                    status @ 500..=599 => {
                        self.metrics.record_failure();
                        self.breaker.record_failure();
                        warn!(path = %req.path, status, attempt, "Server error from upstream");
                        format!("HTTP {status}")
                    }
                    status => {
                        self.metrics.record_failure();
                        warn!(path = %req.path, status, "Permanent rejection, not retrying");
                        return Err(ClientError::Permanent { status });
                    }
                },
                Err(err) => {
                    self.metrics.record_failure();
                    self.breaker.record_failure();
                    warn!(path = %req.path, attempt, error = %err, "Transport failure");
                    err.to_string()
                }
            };

            if attempt >= self.max_attempts {
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            tokio::time::sleep(self.backoff.delay(attempt)).await;
        }
    }

    // ------------------------------------------------------------------
    // Typed endpoint wrappers
    // ------------------------------------------------------------------

    /// One page of the publication-list endpoint
    pub async fn list_page(
        &self,
        window: &QueryWindow,
        state: Option<&str>,
        modality: u16,
        page: u32,
        page_size: u16,
    ) -> Result<ListPage, ClientError> {
        let mut req = ApiRequest::new("/v1/tenders/published")
            .with("startDate", window.start)
            .with("endDate", window.end)
            .with("modality", modality)
            .with("page", page)
            .with("pageSize", page_size);
        if let Some(uf) = state {
            req = req.with("state", uf);
        }

        let resp = self.call(req).await?;
        parse_body(&resp.body)
    }

    /// Full (or capped) sub-record listing for a tender
    pub async fn list_items(
        &self,
        key: &TenderKey,
        max_items: Option<u32>,
    ) -> Result<Vec<ItemDto>, ClientError> {
        let mut req = ApiRequest::new(items_path(key));
        if let Some(max) = max_items {
            req = req.with("maxItems", max);
        }

        let resp = self.call(req).await?;
        let listing: ItemListing = parse_body(&resp.body)?;
        Ok(listing.data)
    }

    /// One sub-record by index; `None` when the tender has no such item
    pub async fn item_detail(
        &self,
        key: &TenderKey,
        item_number: u32,
    ) -> Result<Option<ItemDto>, ClientError> {
        let req = ApiRequest::new(format!("{}/{}", items_path(key), item_number));
        match self.call(req).await {
            Ok(resp) => Ok(Some(parse_body(&resp.body)?)),
            Err(ClientError::Permanent { status: 404 }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolved result (homologated price, winning supplier) for one
    /// sub-record; `None` when no result was published yet
    pub async fn item_result(
        &self,
        key: &TenderKey,
        item_number: u32,
        result_index: Option<u32>,
    ) -> Result<Option<ItemResultDto>, ClientError> {
        let path = match result_index {
            Some(idx) => format!("{}/{}/results/{}", items_path(key), item_number, idx),
            None => format!("{}/{}/results", items_path(key), item_number),
        };
        match self.call(ApiRequest::new(path)).await {
            Ok(resp) => Ok(Some(parse_body(&resp.body)?)),
            Err(ClientError::Permanent { status: 404 }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn items_path(key: &TenderKey) -> String {
    format!(
        "/v1/orgs/{}/tenders/{}/{}/items",
        key.cnpj, key.year, key.sequential
    )
}

fn parse_body<D: DeserializeOwned>(body: &str) -> Result<D, ClientError> {
    serde_json::from_str(body).map_err(|e| ClientError::Malformed(e.to_string()))
}
