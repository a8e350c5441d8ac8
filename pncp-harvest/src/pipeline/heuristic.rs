//! Stage 2: heuristic quick filter (zero network cost)
//!
//! Lookup order per candidate follows the cache tiers: organization verdict
//! first (a high-confidence hit decides outright and also exempts the
//! candidate from sampling), then a fresh candidate-tier verdict from an
//! earlier run, then the pure keyword/value score against the admission
//! threshold. New candidate-tier verdicts are written at the end of the
//! stage so they are visible before Stage 3 starts; existing fresh entries
//! are never overwritten here (Stage 3's verdicts are better evidence).

use crate::cache::{CacheEntry, SubjectKind, TieredCache};
use crate::scoring::{QuickScore, RelevanceScorer};
use crate::types::ScoredTender;
use pncp_common::config::HarvestConfig;
use pncp_common::models::{Tender, Verdict, VerdictSource};
use tracing::{debug, info};

pub fn run(
    scorer: &RelevanceScorer,
    cache: &TieredCache,
    config: &HarvestConfig,
    tenders: Vec<Tender>,
) -> Vec<ScoredTender> {
    let input = tenders.len();
    let mut admitted: Vec<ScoredTender> = Vec::new();
    let mut org_hits = 0usize;
    let mut rejected = 0usize;

    for tender in tenders {
        // (a) Organization tier: a strong prior decides without scoring
        if let Some(entry) = cache.organization_verdict(&tender.key.cnpj) {
            if entry.confidence >= config.org_confidence_threshold {
                org_hits += 1;
                match entry.verdict {
                    Verdict::Relevant => admitted.push(ScoredTender {
                        tender,
                        score: entry.confidence as i32,
                        via_org_cache: true,
                    }),
                    Verdict::Irrelevant => rejected += 1,
                }
                continue;
            }
        }

        // (b) Candidate tier: a fresh verdict from an earlier run decides
        // without rescoring; Irrelevant here means a previous sampling
        // pass already ruled the candidate out
        if let Some(entry) = cache.lookup(SubjectKind::Tender, &tender.control_number) {
            match entry.verdict {
                Verdict::Relevant => admitted.push(ScoredTender {
                    score: entry.confidence as i32,
                    via_org_cache: false,
                    tender,
                }),
                Verdict::Irrelevant => rejected += 1,
            }
            continue;
        }

        // (c) Pure deterministic score
        let score = match scorer.quick_score(
            &tender.org_name,
            &tender.description,
            tender.total_value,
            tender.modality,
        ) {
            QuickScore::Rejected => {
                rejected += 1;
                continue;
            }
            QuickScore::Score(score) => score,
        };

        // Value floor/ceiling: out-of-band tenders are not worth sampling
        let value = tender.effective_value();
        if value < config.min_value {
            rejected += 1;
            continue;
        }
        if let Some(max) = config.max_value {
            if value > max {
                rejected += 1;
                continue;
            }
        }

        // (d) Admission threshold
        if score >= config.admission_threshold {
            admitted.push(ScoredTender {
                tender,
                score,
                via_org_cache: false,
            });
        } else {
            debug!(
                control_number = %tender.control_number,
                score,
                "Below admission threshold, discarded"
            );
            rejected += 1;
        }
    }

    // Strongest candidates first, so a cut-short Stage 3 spends its
    // budget where it matters
    admitted.sort_by(|a, b| b.score.cmp(&a.score));

    // Candidate-tier cache writes happen at the stage boundary; entries
    // that already exist carry earlier (stronger) evidence and stay
    for scored in admitted.iter().filter(|s| !s.via_org_cache) {
        if cache
            .lookup(SubjectKind::Tender, &scored.tender.control_number)
            .is_some()
        {
            continue;
        }
        cache.record(
            SubjectKind::Tender,
            scored.tender.control_number.clone(),
            CacheEntry::new(
                Verdict::Relevant,
                scored.score.clamp(0, 100) as u8,
                VerdictSource::Keyword,
            ),
        );
    }

    info!(
        input,
        admitted = admitted.len(),
        rejected,
        org_cache_hits = org_hits,
        "Quick filter complete"
    );

    admitted
}
