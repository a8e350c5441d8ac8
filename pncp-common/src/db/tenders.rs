//! Tender persistence and dedup queries

use crate::models::{Tender, TenderItem, VerdictSource};
use crate::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;

/// Bind limit headroom: SQLite allows 999 host parameters by default
const IN_CHUNK_SIZE: usize = 400;

/// Return the subset of `control_numbers` already present in the store.
///
/// One batched existence check per chunk, so cost tracks the size of the
/// incoming batch rather than the size of the historical table.
pub async fn existing_control_numbers(
    pool: &SqlitePool,
    control_numbers: &[String],
) -> Result<HashSet<String>> {
    let mut existing = HashSet::new();

    for chunk in control_numbers.chunks(IN_CHUNK_SIZE) {
        let mut builder =
            sqlx::QueryBuilder::new("SELECT control_number FROM tenders WHERE control_number IN (");
        let mut separated = builder.separated(", ");
        for control_number in chunk {
            separated.push_bind(control_number);
        }
        builder.push(")");

        let rows: Vec<String> = builder.build_query_scalar().fetch_all(pool).await?;
        existing.extend(rows);
    }

    Ok(existing)
}

/// Persist a confirmed tender and its resolved items.
///
/// Re-persisting the same control number replaces the previous row, so a
/// rerun that re-materializes a tender stays idempotent.
pub async fn save_tender(
    pool: &SqlitePool,
    tender: &Tender,
    confidence: u8,
    source: VerdictSource,
    items: &[TenderItem],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT OR REPLACE INTO tenders
            (control_number, org_cnpj, org_name, year, sequential, modality,
             published, description, total_value, confidence, verdict_source, harvested_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&tender.control_number)
    .bind(&tender.key.cnpj)
    .bind(&tender.org_name)
    .bind(tender.key.year as i64)
    .bind(tender.key.sequential as i64)
    .bind(tender.modality as i64)
    .bind(tender.published.to_string())
    .bind(&tender.description)
    .bind(tender.total_value)
    .bind(confidence as i64)
    .bind(source.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    for item in items {
        let codes = serde_json::to_string(&item.classification_codes)
            .unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT OR REPLACE INTO tender_items
                (control_number, item_number, description, classification_codes, unit_price)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&tender.control_number)
        .bind(item.item_number as i64)
        .bind(&item.description)
        .bind(codes)
        .bind(item.unit_price)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Count persisted tenders (run summaries and tests)
pub async fn tender_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
