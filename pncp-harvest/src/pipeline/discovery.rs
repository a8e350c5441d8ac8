//! Stage 1: bulk discovery
//!
//! Sequential page iteration per modality code, so page ordering within a
//! modality is preserved and the quota budget is spent predictably. A page
//! that exhausts its retries does not abort the run: everything collected
//! so far is kept and a structured shortfall names the modality, page and
//! failure kind. Only access denial stops discovery outright.

use crate::client::{RateGovernedClient, Transport};
use crate::types::{Shortfall, TenderDto};
use pncp_common::config::HarvestConfig;
use pncp_common::models::Tender;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct DiscoveryOutput {
    pub tenders: Vec<Tender>,
    pub shortfalls: Vec<Shortfall>,
    /// Set when upstream denied access; the orchestrator halts the run
    pub access_denied: bool,
}

pub async fn run<T: Transport>(
    client: &RateGovernedClient<T>,
    config: &HarvestConfig,
) -> DiscoveryOutput {
    let mut output = DiscoveryOutput::default();

    'modalities: for &modality in &config.modalities {
        let mut page: u32 = 1;

        loop {
            if output.tenders.len() >= config.max_candidates {
                info!(
                    cap = config.max_candidates,
                    "Discovery cap reached, stopping"
                );
                break 'modalities;
            }

            let envelope = match client
                .list_page(
                    &config.window,
                    config.state.as_deref(),
                    modality,
                    page,
                    config.page_size,
                )
                .await
            {
                Ok(envelope) => envelope,
                Err(err) if err.is_fatal() => {
                    warn!(modality, page, "Access denied during discovery");
                    output.access_denied = true;
                    break 'modalities;
                }
                Err(err) => {
                    warn!(modality, page, error = %err, "Page unrecoverable, keeping partial results");
                    output.shortfalls.push(Shortfall {
                        modality,
                        page,
                        kind: err.shortfall_kind(),
                    });
                    // Move on to the next modality; its pages may be fine
                    break;
                }
            };

            if envelope.empty || envelope.data.is_empty() {
                break;
            }

            let remaining_cap = config.max_candidates - output.tenders.len();
            let fetched = envelope.data.len();
            output.tenders.extend(
                envelope
                    .data
                    .into_iter()
                    .take(remaining_cap)
                    .map(|dto: TenderDto| Tender::from(dto)),
            );

            debug!(
                modality,
                page,
                fetched,
                remaining_pages = envelope.remaining_pages,
                "Discovery page retrieved"
            );

            if envelope.remaining_pages == 0 {
                break;
            }
            page += 1;
        }
    }

    info!(
        tenders = output.tenders.len(),
        shortfalls = output.shortfalls.len(),
        "Discovery complete"
    );
    output
}
