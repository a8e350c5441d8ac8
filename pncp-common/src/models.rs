//! Shared domain models for the harvest pipeline
//!
//! A tender is identified two ways by the upstream portal:
//! - the control number: a globally unique, stable string key used for
//!   deduplication and persistence
//! - the (cnpj, year, sequential) triple: path components for the
//!   sub-record endpoints

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifier components for the sub-record endpoints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenderKey {
    /// Issuing organization identifier (CNPJ, digits only)
    pub cnpj: String,
    /// Procurement year
    pub year: u16,
    /// Sequential number within (cnpj, year)
    pub sequential: u32,
}

/// A procurement notice fetched from the publication-list endpoint,
/// pending relevance confirmation. Immutable once fetched within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tender {
    /// Globally unique, stable control number (exact-match dedup key)
    pub control_number: String,
    pub key: TenderKey,
    pub org_name: String,
    /// Contracting modality code (category filter at discovery time)
    pub modality: u16,
    pub published: NaiveDate,
    /// Raw descriptive text (the procurement object)
    pub description: String,
    /// Homologated total value in BRL, when the portal reports one
    pub total_value: Option<f64>,
}

impl Tender {
    /// Value used for tiering and value-band scoring (0.0 when unreported)
    pub fn effective_value(&self) -> f64 {
        self.total_value.unwrap_or(0.0)
    }
}

/// A line item within a tender, resolved during sampling/materialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderItem {
    pub item_number: u32,
    pub description: String,
    /// Classification codes extracted from the description text
    #[serde(default)]
    pub classification_codes: Vec<String>,
    /// Resolved (homologated) unit price, when available
    pub unit_price: Option<f64>,
}

/// Relevance verdict for a cached or persisted subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Relevant,
    Irrelevant,
}

/// How a verdict was derived (provenance, strongest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// A classification code in the target range was found
    ExplicitCode,
    /// Keyword/value heuristics
    Keyword,
    /// Corroborating confirmations from the same organization
    OrgHistory,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::ExplicitCode => "explicit_code",
            VerdictSource::Keyword => "keyword",
            VerdictSource::OrgHistory => "org_history",
        }
    }
}

impl std::str::FromStr for VerdictSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "explicit_code" => Ok(VerdictSource::ExplicitCode),
            "keyword" => Ok(VerdictSource::Keyword),
            "org_history" => Ok(VerdictSource::OrgHistory),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown verdict source: {other}"
            ))),
        }
    }
}

/// Normalize an organization identifier to digits only.
///
/// The portal formats CNPJs inconsistently ("26.989.715/0001-23" vs
/// "26989715000123"); cache keys and org grouping use the digit form.
pub fn normalize_org_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}
