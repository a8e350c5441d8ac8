//! Stage 3: sample validation
//!
//! Three phases, mirroring how evidence strength decays:
//! 1. Auto-approval without network: org-cache shortcuts from Stage 2,
//!    fresh cached verdicts, and high-confidence keyword signals.
//! 2. Bounded sampling for the rest: at most `sample_size` sub-records per
//!    candidate, fetched one at a time so a target-range classification
//!    code on an early item stops further fetches for that candidate.
//! 3. Org history: once an organization accumulates enough confirmations,
//!    its remaining unconfirmed candidates are approved and the org is
//!    promoted into the organization cache tier.
//!
//! All cache writes (item tier, tender tier, org promotions) happen at the
//! stage boundary, after the concurrent phase has drained.

use crate::cache::{CacheEntry, SubjectKind, TieredCache};
use crate::client::{RateGovernedClient, Transport};
use crate::scoring::RelevanceScorer;
use crate::types::{ConfirmedTender, ItemDto, ScoredTender};
use futures::stream::{self, StreamExt};
use pncp_common::config::HarvestConfig;
use pncp_common::models::{TenderItem, Verdict, VerdictSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Fixed confidence when a target-range classification code is found
const CODE_CONFIRM_CONFIDENCE: u8 = 95;
/// Confidence assigned to org-history approvals
const ORG_APPROVE_CONFIDENCE: u8 = 75;
/// Confidence recorded when an org is promoted into the cache
const ORG_PROMOTION_CONFIDENCE: u8 = 80;
/// Tender-tier confidence recorded for sampled-and-discarded candidates
const SAMPLING_DISCARD_CONFIDENCE: u8 = 60;
/// Keyword auto-approval cap
const AUTO_APPROVE_CAP: u8 = 95;

#[derive(Debug, Default)]
pub struct SamplingOutput {
    pub confirmed: Vec<ConfirmedTender>,
    /// Set when upstream denied access mid-stage; already-issued fetches
    /// were drained, no new ones were started
    pub access_denied: bool,
}

enum SampleResult {
    Confirmed {
        confirmed: ConfirmedTender,
        /// (item key, entry) pairs applied to the item tier at stage end
        item_entries: Vec<(String, CacheEntry)>,
    },
    Discarded(ScoredTender),
    /// Never sampled: permit denied after a fatal error elsewhere
    Skipped(ScoredTender),
}

pub async fn run<T: Transport>(
    client: &RateGovernedClient<T>,
    scorer: &RelevanceScorer,
    cache: &TieredCache,
    config: &HarvestConfig,
    admitted: Vec<ScoredTender>,
) -> SamplingOutput {
    let input = admitted.len();
    let mut confirmed: Vec<ConfirmedTender> = Vec::new();
    let mut needs_sampling: Vec<ScoredTender> = Vec::new();
    let mut cache_discards = 0usize;

    // ------------------------------------------------------------------
    // Phase 1: approval without network calls
    // ------------------------------------------------------------------
    for scored in admitted {
        if scored.via_org_cache {
            confirmed.push(ConfirmedTender {
                confidence: scored.score.clamp(0, 100) as u8,
                source: VerdictSource::OrgHistory,
                sampled_items: Vec::new(),
                tender: scored.tender,
            });
            continue;
        }

        // Candidate tier: verdicts from earlier runs
        if let Some(entry) = cache.lookup(SubjectKind::Tender, &scored.tender.control_number) {
            match entry.verdict {
                Verdict::Irrelevant => {
                    // Sampled before and ruled out; don't spend calls again
                    cache_discards += 1;
                    continue;
                }
                Verdict::Relevant if entry.source == VerdictSource::ExplicitCode => {
                    confirmed.push(ConfirmedTender {
                        confidence: entry.confidence,
                        source: entry.source,
                        sampled_items: Vec::new(),
                        tender: scored.tender,
                    });
                    continue;
                }
                Verdict::Relevant => {}
            }
        }

        let strong = scorer.strong_keyword_count(&scored.tender.description);
        if scored.score >= config.auto_approve_score || strong >= 2 {
            let confidence = (scored.score.clamp(0, 100) as u8)
                .max(60 + 10 * strong.min(3) as u8)
                .min(AUTO_APPROVE_CAP);
            debug!(
                control_number = %scored.tender.control_number,
                score = scored.score,
                strong_keywords = strong,
                "Auto-approved without sampling"
            );
            confirmed.push(ConfirmedTender {
                confidence,
                source: VerdictSource::Keyword,
                sampled_items: Vec::new(),
                tender: scored.tender,
            });
        } else {
            needs_sampling.push(scored);
        }
    }

    info!(
        input,
        auto_approved = confirmed.len(),
        cache_discards,
        to_sample = needs_sampling.len(),
        "Sampling phase 1 complete"
    );

    // ------------------------------------------------------------------
    // Phase 2: bounded sampling for the edge cases
    // ------------------------------------------------------------------
    let semaphore = Arc::new(Semaphore::new(config.sample_concurrency.max(1)));
    let denied = Arc::new(AtomicBool::new(false));

    let results: Vec<SampleResult> = stream::iter(needs_sampling.into_iter().map(|scored| {
        let semaphore = Arc::clone(&semaphore);
        let denied = Arc::clone(&denied);
        async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return SampleResult::Skipped(scored),
            };
            if denied.load(Ordering::Acquire) {
                return SampleResult::Skipped(scored);
            }
            sample_one(client, scorer, config, scored, &denied).await
        }
    }))
    .buffer_unordered(config.sample_concurrency.max(1))
    .collect()
    .await;

    let access_denied = denied.load(Ordering::Acquire);

    // Stage-boundary cache writes and result partitioning
    let mut discarded: Vec<ScoredTender> = Vec::new();
    for result in results {
        match result {
            SampleResult::Confirmed {
                confirmed: tender,
                item_entries,
            } => {
                for (key, entry) in item_entries {
                    cache.record(SubjectKind::Item, key, entry);
                }
                confirmed.push(tender);
            }
            SampleResult::Discarded(scored) => discarded.push(scored),
            SampleResult::Skipped(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Phase 3: org-history approval and promotion
    // ------------------------------------------------------------------
    let mut org_counts: HashMap<&str, usize> = HashMap::new();
    for tender in &confirmed {
        *org_counts.entry(tender.tender.key.cnpj.as_str()).or_default() += 1;
    }
    let promotable: Vec<String> = org_counts
        .iter()
        .filter(|(_, &count)| count >= config.org_promotion_count)
        .map(|(cnpj, _)| (*cnpj).to_string())
        .collect();

    let mut org_approved = 0usize;
    let mut still_discarded: Vec<ScoredTender> = Vec::new();
    for scored in discarded {
        if promotable.contains(&scored.tender.key.cnpj) {
            org_approved += 1;
            confirmed.push(ConfirmedTender {
                confidence: ORG_APPROVE_CONFIDENCE,
                source: VerdictSource::OrgHistory,
                sampled_items: Vec::new(),
                tender: scored.tender,
            });
        } else {
            still_discarded.push(scored);
        }
    }

    for cnpj in &promotable {
        cache.record(
            SubjectKind::Organization,
            cnpj.clone(),
            CacheEntry::new(
                Verdict::Relevant,
                ORG_PROMOTION_CONFIDENCE,
                VerdictSource::OrgHistory,
            ),
        );
    }

    // Candidate-tier verdicts from this stage's evidence
    for tender in &confirmed {
        cache.record(
            SubjectKind::Tender,
            tender.tender.control_number.clone(),
            CacheEntry::new(Verdict::Relevant, tender.confidence, tender.source),
        );
    }
    for scored in &still_discarded {
        cache.record(
            SubjectKind::Tender,
            scored.tender.control_number.clone(),
            CacheEntry::new(
                Verdict::Irrelevant,
                SAMPLING_DISCARD_CONFIDENCE,
                VerdictSource::Keyword,
            ),
        );
    }

    info!(
        confirmed = confirmed.len(),
        org_approved,
        promoted_orgs = promotable.len(),
        discarded = still_discarded.len(),
        access_denied,
        "Sampling complete"
    );

    SamplingOutput {
        confirmed,
        access_denied,
    }
}

/// Sample one candidate: fetch sub-records one at a time, stopping at the
/// first target-range classification code.
async fn sample_one<T: Transport>(
    client: &RateGovernedClient<T>,
    scorer: &RelevanceScorer,
    config: &HarvestConfig,
    scored: ScoredTender,
    denied: &AtomicBool,
) -> SampleResult {
    let mut fetched: Vec<TenderItem> = Vec::new();
    let mut code_hit = false;

    for item_number in 1..=config.sample_size {
        match client.item_detail(&scored.tender.key, item_number).await {
            Ok(Some(item)) => {
                let codes = scorer.extract_classification_codes(&item.description);
                let hit = codes.iter().any(|code| scorer.is_target_code(code));
                fetched.push(to_domain_item(item, codes));

                if hit {
                    code_hit = true;
                    // Early termination: no further sub-record fetches
                    break;
                }
            }
            Ok(None) => {
                if item_number == 1 {
                    // Ambiguous upstream behavior: "no sub-records" vs
                    // endpoint instability. Treated as a negative signal;
                    // kept visible for product follow-up.
                    warn!(
                        control_number = %scored.tender.control_number,
                        "No sub-records found while sampling, falling back to keyword score"
                    );
                }
                break;
            }
            Err(err) if err.is_fatal() => {
                denied.store(true, Ordering::Release);
                return SampleResult::Skipped(scored);
            }
            Err(err) => {
                debug!(
                    control_number = %scored.tender.control_number,
                    item_number,
                    error = %err,
                    "Sampling fetch failed, stopping for this candidate"
                );
                break;
            }
        }
    }

    if code_hit {
        let item_entries = fetched
            .iter()
            .filter(|item| {
                item.classification_codes
                    .iter()
                    .any(|code| scorer.is_target_code(code))
            })
            .map(|item| {
                (
                    item_cache_key(&scored.tender.control_number, item.item_number),
                    CacheEntry::new(
                        Verdict::Relevant,
                        CODE_CONFIRM_CONFIDENCE,
                        VerdictSource::ExplicitCode,
                    ),
                )
            })
            .collect();

        return SampleResult::Confirmed {
            confirmed: ConfirmedTender {
                confidence: CODE_CONFIRM_CONFIDENCE,
                source: VerdictSource::ExplicitCode,
                sampled_items: fetched,
                tender: scored.tender,
            },
            item_entries,
        };
    }

    // No explicit code: the Stage 2 keyword score is the confidence
    // signal, reinforced by whatever the fetched items show
    let item_signal = {
        let dtos: Vec<ItemDto> = fetched
            .iter()
            .map(|item| ItemDto {
                item_number: item.item_number,
                description: item.description.clone(),
                quantity: None,
                unit_price: item.unit_price,
            })
            .collect();
        scorer.analyze_sampled_items(&dtos)
    };
    let confidence = (scored.score.clamp(0, 100) as u8).max(item_signal);

    if confidence >= config.confirmation_threshold {
        SampleResult::Confirmed {
            confirmed: ConfirmedTender {
                confidence,
                source: VerdictSource::Keyword,
                sampled_items: fetched,
                tender: scored.tender,
            },
            item_entries: Vec::new(),
        }
    } else {
        SampleResult::Discarded(scored)
    }
}

fn to_domain_item(dto: ItemDto, codes: Vec<String>) -> TenderItem {
    TenderItem {
        item_number: dto.item_number,
        description: dto.description,
        classification_codes: codes,
        unit_price: dto.unit_price,
    }
}

fn item_cache_key(control_number: &str, item_number: u32) -> String {
    format!("{control_number}#{item_number}")
}
