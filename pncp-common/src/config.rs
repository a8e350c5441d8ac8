//! Configuration loading for the harvest pipeline
//!
//! A single TOML file carries every recognized option; any missing field
//! falls back to its documented default, and a missing file falls back to
//! the full default configuration with a warning rather than terminating.

use crate::{Error, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Calendar window queried against the publication-list endpoint
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Default for QueryWindow {
    fn default() -> Self {
        // Trailing week ending today; real runs configure this explicitly
        let end = Utc::now().date_naive();
        Self {
            start: end - ChronoDuration::days(7),
            end,
        }
    }
}

/// Concurrency allotment per value tier during full materialization.
/// High-value tenders are rarer and more valuable to resolve quickly.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ValueTiers {
    /// Values above this (BRL) are high tier
    pub high_floor: f64,
    /// Values below this (BRL) are low tier
    pub low_ceiling: f64,
    pub high_concurrency: usize,
    pub medium_concurrency: usize,
    pub low_concurrency: usize,
}

impl Default for ValueTiers {
    fn default() -> Self {
        Self {
            high_floor: 100_000.0,
            low_ceiling: 10_000.0,
            high_concurrency: 10,
            medium_concurrency: 5,
            low_concurrency: 3,
        }
    }
}

/// Full configuration surface for a harvest run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    // Query window and discovery filters
    pub window: QueryWindow,
    /// Contracting modality codes to discover (electronic bidding defaults)
    pub modalities: Vec<u16>,
    /// Optional state (UF) filter
    pub state: Option<String>,
    /// Hard cap on raw candidates per run
    pub max_candidates: usize,
    /// Page size requested from the list endpoint (server caps at 500)
    pub page_size: u16,

    // Value filters (quick-filter stage)
    pub min_value: f64,
    pub max_value: Option<f64>,

    // Stage thresholds
    /// Minimum heuristic score to advance past the quick filter
    pub admission_threshold: i32,
    /// Sub-records sampled per candidate before falling back to keywords
    pub sample_size: u32,
    /// Minimum confidence for sampling-stage confirmation
    pub confirmation_threshold: u8,
    /// Quick-filter score at which sampling is skipped entirely
    pub auto_approve_score: i32,
    /// Org-cache confidence that short-circuits filtering for an org
    pub org_confidence_threshold: u8,
    /// Confirmations from one org before its remaining candidates are
    /// approved and the org is promoted into the cache
    pub org_promotion_count: usize,

    // Verdict cache
    pub cache_ttl_days: i64,
    pub cache_path: PathBuf,

    // Rate governance
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Fraction of the published caps actually used (safety margin)
    pub quota_margin: f64,
    /// Bounded retry attempts per call for transient failures
    pub retry_attempts: u32,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,

    // Stage concurrency
    pub sample_concurrency: usize,
    pub tiers: ValueTiers,

    // Collaborators
    pub api_base_url: String,
    pub db_path: PathBuf,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            window: QueryWindow::default(),
            modalities: vec![4, 6, 8],
            state: None,
            max_candidates: 1000,
            page_size: 100,
            min_value: 1_000.0,
            max_value: None,
            admission_threshold: 30,
            sample_size: 3,
            confirmation_threshold: 50,
            auto_approve_score: 70,
            org_confidence_threshold: 70,
            org_promotion_count: 2,
            cache_ttl_days: 30,
            cache_path: PathBuf::from("verdict_cache.json"),
            requests_per_minute: 60,
            requests_per_hour: 1000,
            quota_margin: 0.75,
            retry_attempts: 3,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            sample_concurrency: 5,
            tiers: ValueTiers::default(),
            api_base_url: "https://pncp.gov.br/api/consulta".to_string(),
            db_path: PathBuf::from("pncp_harvest.db"),
        }
    }
}

impl HarvestConfig {
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    /// Effective per-minute quota after applying the safety margin
    pub fn effective_per_minute(&self) -> u32 {
        scaled_quota(self.requests_per_minute, self.quota_margin)
    }

    /// Effective per-hour quota after applying the safety margin
    pub fn effective_per_hour(&self) -> u32 {
        scaled_quota(self.requests_per_hour, self.quota_margin)
    }

    /// Validate cross-field constraints that serde defaults can't express
    pub fn validate(&self) -> Result<()> {
        if self.window.start > self.window.end {
            return Err(Error::Config(format!(
                "window start {} is after window end {}",
                self.window.start, self.window.end
            )));
        }
        if self.modalities.is_empty() {
            return Err(Error::Config("no modality codes configured".to_string()));
        }
        if !(0.0..=1.0).contains(&self.quota_margin) {
            return Err(Error::Config(format!(
                "quota margin {} outside [0.0, 1.0]",
                self.quota_margin
            )));
        }
        if self.sample_size == 0 {
            return Err(Error::Config("sample size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn scaled_quota(published: u32, margin: f64) -> u32 {
    ((published as f64 * margin) as u32).max(1)
}

/// Load configuration from a TOML file.
///
/// A missing file is not fatal: the defaults are returned and a warning
/// logged, so a first run works without any setup. A present-but-invalid
/// file is a hard error.
pub fn load_config(path: &Path) -> Result<HarvestConfig> {
    if !path.exists() {
        warn!(
            "Config file not found: {} - using defaults",
            path.display()
        );
        return Ok(HarvestConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: HarvestConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.validate()?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
