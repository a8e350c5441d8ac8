//! Deduplication gate against the durable store
//!
//! Runs once, between discovery and the quick filter: one batched
//! existence check over the incoming control numbers, exact matching only
//! (the upstream asserts control numbers are stable and globally unique).
//! Cost tracks the batch size, not the store's history.

use pncp_common::db::tenders;
use pncp_common::models::Tender;
use pncp_common::Result;
use sqlx::SqlitePool;
use tracing::info;

pub struct DedupGate {
    pool: SqlitePool,
}

impl DedupGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the subset of `candidates` not already persisted,
    /// preserving input order.
    pub async fn filter_unseen(&self, candidates: Vec<Tender>) -> Result<Vec<Tender>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<String> = candidates
            .iter()
            .map(|t| t.control_number.clone())
            .collect();
        let existing = tenders::existing_control_numbers(&self.pool, &ids).await?;

        let total = candidates.len();
        let unseen: Vec<Tender> = candidates
            .into_iter()
            .filter(|t| !existing.contains(&t.control_number))
            .collect();

        info!(
            total,
            duplicates = total - unseen.len(),
            unseen = unseen.len(),
            "Deduplication gate applied"
        );

        Ok(unseen)
    }
}
