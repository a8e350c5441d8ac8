//! Stage 4: full materialization
//!
//! Only runs for confirmed candidates; relevance was settled upstream and
//! is never re-derived here. Fetches the complete sub-record set and the
//! resolved price per item. Concurrency is tiered by tender value: the
//! high-value bucket gets the largest allotment. A failed candidate is
//! reported separately and never aborts the stage.

use crate::client::{RateGovernedClient, Transport};
use crate::scoring::RelevanceScorer;
use crate::types::{ConfirmedTender, FailedTender, MaterializedTender};
use futures::stream::{self, StreamExt};
use pncp_common::config::HarvestConfig;
use pncp_common::models::TenderItem;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct MaterializeOutput {
    pub materialized: Vec<MaterializedTender>,
    pub failed: Vec<FailedTender>,
    pub access_denied: bool,
}

enum Processed {
    Done(MaterializedTender),
    Failed(FailedTender),
}

pub async fn run<T: Transport>(
    client: &RateGovernedClient<T>,
    scorer: &RelevanceScorer,
    config: &HarvestConfig,
    confirmed: Vec<ConfirmedTender>,
) -> MaterializeOutput {
    let input = confirmed.len();
    let mut output = MaterializeOutput::default();

    // Value-tier buckets, processed highest value first
    let mut high = Vec::new();
    let mut medium = Vec::new();
    let mut low = Vec::new();
    for tender in confirmed {
        let value = tender.tender.effective_value();
        if value > config.tiers.high_floor {
            high.push(tender);
        } else if value < config.tiers.low_ceiling {
            low.push(tender);
        } else {
            medium.push(tender);
        }
    }

    info!(
        high = high.len(),
        medium = medium.len(),
        low = low.len(),
        "Materialization tiers"
    );

    let denied = Arc::new(AtomicBool::new(false));
    let buckets = [
        (high, config.tiers.high_concurrency),
        (medium, config.tiers.medium_concurrency),
        (low, config.tiers.low_concurrency),
    ];

    for (bucket, bound) in buckets {
        if bucket.is_empty() {
            continue;
        }
        let bound = bound.max(1);
        let semaphore = Arc::new(Semaphore::new(bound));

        let results: Vec<Processed> = stream::iter(bucket.into_iter().map(|tender| {
            let semaphore = Arc::clone(&semaphore);
            let denied = Arc::clone(&denied);
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Processed::Failed(not_attempted(&tender));
                    }
                };
                if denied.load(Ordering::Acquire) {
                    return Processed::Failed(not_attempted(&tender));
                }
                materialize_one(client, scorer, tender, &denied).await
            }
        }))
        .buffer_unordered(bound)
        .collect()
        .await;

        for result in results {
            match result {
                Processed::Done(tender) => output.materialized.push(tender),
                Processed::Failed(failure) => output.failed.push(failure),
            }
        }
    }

    output.access_denied = denied.load(Ordering::Acquire);

    info!(
        input,
        materialized = output.materialized.len(),
        failed = output.failed.len(),
        "Materialization complete"
    );
    output
}

async fn materialize_one<T: Transport>(
    client: &RateGovernedClient<T>,
    scorer: &RelevanceScorer,
    confirmed: ConfirmedTender,
    denied: &AtomicBool,
) -> Processed {
    let key = &confirmed.tender.key;

    // Sub-records already fetched during sampling carry their extracted
    // codes and (sometimes) prices; reuse instead of re-deriving
    let sampled: HashMap<u32, &TenderItem> = confirmed
        .sampled_items
        .iter()
        .map(|item| (item.item_number, item))
        .collect();

    let listing = match client.list_items(key, None).await {
        Ok(listing) => listing,
        Err(err) => {
            if err.is_fatal() {
                denied.store(true, Ordering::Release);
            }
            return Processed::Failed(FailedTender {
                control_number: confirmed.tender.control_number.clone(),
                error: format!("item listing failed: {err}"),
            });
        }
    };

    let mut items: Vec<TenderItem> = Vec::with_capacity(listing.len());
    for dto in listing {
        let codes = match sampled.get(&dto.item_number) {
            Some(known) => known.classification_codes.clone(),
            None => scorer.extract_classification_codes(&dto.description),
        };

        let unit_price = match dto.unit_price {
            Some(price) => Some(price),
            None => {
                // Per-item result failures degrade to an unresolved price;
                // they don't fail the candidate
                match client.item_result(key, dto.item_number, None).await {
                    Ok(result) => result.and_then(|r| r.resolved_price),
                    Err(err) => {
                        if err.is_fatal() {
                            denied.store(true, Ordering::Release);
                            return Processed::Failed(FailedTender {
                                control_number: confirmed.tender.control_number.clone(),
                                error: "access denied while resolving prices".to_string(),
                            });
                        }
                        debug!(
                            control_number = %confirmed.tender.control_number,
                            item_number = dto.item_number,
                            error = %err,
                            "Item result unavailable"
                        );
                        None
                    }
                }
            }
        };

        items.push(TenderItem {
            item_number: dto.item_number,
            description: dto.description,
            classification_codes: codes,
            unit_price,
        });
    }

    Processed::Done(MaterializedTender {
        tender: confirmed.tender,
        confidence: confirmed.confidence,
        source: confirmed.source,
        items,
    })
}

fn not_attempted(tender: &ConfirmedTender) -> FailedTender {
    FailedTender {
        control_number: tender.tender.control_number.clone(),
        error: "not attempted: run halted".to_string(),
    }
}
