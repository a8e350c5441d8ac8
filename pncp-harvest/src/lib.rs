//! # pncp-harvest
//!
//! Progressive multi-stage harvesting of procurement notices from the
//! PNCP consultation API:
//!
//! - **Stage 1** bulk discovery (paginated list endpoint)
//! - **Dedup gate** against previously persisted control numbers
//! - **Stage 2** zero-network heuristic filter (rule-table scoring +
//!   organization verdict cache)
//! - **Stage 3** bounded sub-record sampling with early termination on
//!   classification-code hits
//! - **Stage 4** value-tiered full materialization and persistence
//!
//! All upstream access goes through one rate-governed client (dual quotas,
//! adaptive backoff, circuit breaker); verdicts are cached across runs in
//! a tiered, TTL-bounded snapshot.

pub mod cache;
pub mod client;
pub mod dedup;
pub mod events;
pub mod pipeline;
pub mod rules;
pub mod scoring;
pub mod types;

pub use events::{EventBus, HarvestEvent};
pub use pipeline::HarvestPipeline;
