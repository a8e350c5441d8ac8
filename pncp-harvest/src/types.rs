//! Wire DTOs and pipeline data contracts
//!
//! The DTO types mirror the upstream consultation API envelope; the
//! pipeline types are the explicit contracts between stages. A candidate
//! only ever moves forward by being rewrapped into the next stage's type,
//! which keeps the "Stage 4 never re-derives relevance" invariant visible
//! in the signatures.

use pncp_common::models::{normalize_org_id, Tender, TenderItem, TenderKey, VerdictSource};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Wire types (list endpoint envelope, sub-record endpoints)
// ============================================================================

/// Response envelope of the publication-list endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    #[serde(default)]
    pub data: Vec<TenderDto>,
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub remaining_pages: u32,
    #[serde(default)]
    pub empty: bool,
}

/// A tender record as the list endpoint reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderDto {
    pub control_number: String,
    pub org_id: String,
    pub org_name: String,
    pub year: u16,
    pub sequential: u32,
    pub modality: u16,
    pub published_date: chrono::NaiveDate,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub total_value: Option<f64>,
}

impl From<TenderDto> for Tender {
    fn from(dto: TenderDto) -> Self {
        Tender {
            control_number: dto.control_number,
            key: TenderKey {
                cnpj: normalize_org_id(&dto.org_id),
                year: dto.year,
                sequential: dto.sequential,
            },
            org_name: dto.org_name,
            modality: dto.modality,
            published: dto.published_date,
            description: dto.description,
            total_value: dto.total_value,
        }
    }
}

/// A sub-record as the item listing/detail endpoints report it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDto {
    pub item_number: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
}

/// Item listing envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemListing {
    #[serde(default)]
    pub data: Vec<ItemDto>,
}

/// Resolved result for one sub-record (homologated price + winner)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResultDto {
    #[serde(default)]
    pub resolved_price: Option<f64>,
    #[serde(default)]
    pub supplier: Option<String>,
}

// ============================================================================
// Partial-failure reporting
// ============================================================================

/// Why a discovery page (or the whole run) fell short of the cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallKind {
    /// Transient failures exhausted the retry budget
    RetriesExhausted,
    /// Upstream rejected the request permanently (4xx / malformed body)
    Permanent,
    /// The circuit breaker was open; the page was never requested
    BreakerOpen,
}

impl std::fmt::Display for ShortfallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShortfallKind::RetriesExhausted => "retries exhausted",
            ShortfallKind::Permanent => "permanent rejection",
            ShortfallKind::BreakerOpen => "breaker open",
        };
        f.write_str(s)
    }
}

/// Structured reason a discovery page could not be retrieved.
/// Carried alongside the partial result set, never instead of it.
#[derive(Debug, Clone, Serialize)]
pub struct Shortfall {
    pub modality: u16,
    pub page: u32,
    pub kind: ShortfallKind,
}

/// Why a run stopped before completing all stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbortReason {
    /// Upstream denied access (HTTP 403); all further calls halted
    AccessDenied,
    /// Breaker still open at a stage barrier after its cooldown
    BreakerExhausted,
    /// Caller cancelled between stages
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::AccessDenied => "access denied by upstream",
            AbortReason::BreakerExhausted => "circuit breaker exhausted",
            AbortReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Stage contracts
// ============================================================================

/// A candidate that cleared the quick filter
#[derive(Debug, Clone)]
pub struct ScoredTender {
    pub tender: Tender,
    /// Deterministic heuristic score (0-100)
    pub score: i32,
    /// True when an org-cache hit short-circuited scoring; such candidates
    /// also skip sample validation
    pub via_org_cache: bool,
}

/// A candidate whose relevance was confirmed (code, keywords, or org history)
#[derive(Debug, Clone)]
pub struct ConfirmedTender {
    pub tender: Tender,
    pub confidence: u8,
    pub source: VerdictSource,
    /// Sub-records already fetched during sampling, reused by materialization
    pub sampled_items: Vec<TenderItem>,
}

/// A confirmed candidate with its full sub-record set resolved
#[derive(Debug, Clone)]
pub struct MaterializedTender {
    pub tender: Tender,
    pub confidence: u8,
    pub source: VerdictSource,
    pub items: Vec<TenderItem>,
}

/// A confirmed candidate that failed materialization (reported, not dropped
/// silently; does not abort the stage)
#[derive(Debug, Clone)]
pub struct FailedTender {
    pub control_number: String,
    pub error: String,
}

/// Everything a run produced, partial or complete
#[derive(Debug)]
pub struct HarvestOutcome {
    pub run_id: Uuid,
    pub confirmed: Vec<MaterializedTender>,
    pub failed: Vec<FailedTender>,
    pub shortfalls: Vec<Shortfall>,
    /// Set when the run stopped early; partial results above still stand
    pub aborted: Option<AbortReason>,
    pub metrics: crate::pipeline::metrics::RunMetrics,
}
