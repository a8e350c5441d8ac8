//! Harvest pipeline orchestration
//!
//! Strict barrier pipeline: discovery -> dedup gate -> quick filter ->
//! sample validation -> materialization -> persistence. Stage n+1 only
//! starts after stage n has fully completed (or exhausted its
//! partial-failure path), so all of a stage's cache writes and metrics are
//! visible at the next barrier.
//!
//! The orchestrator owns the per-stage metrics records, checks for
//! cancellation and breaker exhaustion between stages (never mid-stage; an
//! in-flight stage drains its issued requests), and always returns the
//! partial results accumulated so far together with a structured reason
//! when a run stops early.

pub mod discovery;
pub mod heuristic;
pub mod materialize;
pub mod metrics;
pub mod sampling;

use crate::cache::TieredCache;
use crate::client::{BackoffPolicy, BreakerState, RateGovernedClient, Transport};
use crate::dedup::DedupGate;
use crate::events::HarvestEvent;
use crate::rules::RuleTable;
use crate::scoring::RelevanceScorer;
use crate::types::{AbortReason, ConfirmedTender, FailedTender, HarvestOutcome, Shortfall};
use metrics::{MetricsHub, RunMetrics, Stage, StageMetrics};
use pncp_common::config::HarvestConfig;
use pncp_common::db::tenders;
use pncp_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct HarvestPipeline<T: Transport> {
    client: RateGovernedClient<T>,
    scorer: RelevanceScorer,
    cache: Arc<TieredCache>,
    gate: DedupGate,
    pool: SqlitePool,
    config: HarvestConfig,
    events: broadcast::Sender<HarvestEvent>,
    hub: Arc<MetricsHub>,
}

impl<T: Transport> HarvestPipeline<T> {
    pub fn new(
        transport: T,
        config: HarvestConfig,
        pool: SqlitePool,
        cache: Arc<TieredCache>,
        rules: RuleTable,
        events: broadcast::Sender<HarvestEvent>,
    ) -> Self {
        let hub = Arc::new(MetricsHub::new());
        let client = RateGovernedClient::new(transport, &config, Arc::clone(&hub));

        Self {
            client,
            scorer: RelevanceScorer::new(rules),
            cache,
            gate: DedupGate::new(pool.clone()),
            pool,
            config,
            events,
            hub,
        }
    }

    /// Override the client's retry schedule (tests use millisecond delays)
    pub fn with_client_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.client = self.client.with_backoff(policy);
        self
    }

    /// Run the full pipeline once.
    ///
    /// Infrastructure errors (local store) propagate as `Err`; upstream
    /// failures never do - they surface as shortfalls, per-candidate
    /// failures, or an abort reason on the outcome.
    pub async fn run(&self, cancel: CancellationToken) -> Result<HarvestOutcome> {
        let run_id = Uuid::new_v4();
        let mut run_metrics = RunMetrics::new(run_id);

        info!(
            run_id = %run_id,
            window_start = %self.config.window.start,
            window_end = %self.config.window.end,
            modalities = ?self.config.modalities,
            "Starting harvest run"
        );
        let _ = self.events.send(HarvestEvent::RunStarted {
            run_id,
            window_start: self.config.window.start,
            window_end: self.config.window.end,
        });

        // Stage 1: bulk discovery
        self.stage_started(run_id, Stage::Discovery, 0);
        let started = Instant::now();
        let discovered = discovery::run(&self.client, &self.config).await;
        self.finalize_stage(
            &mut run_metrics,
            run_id,
            Stage::Discovery,
            0,
            discovered.tenders.len(),
            started,
        );

        let mut shortfalls = discovered.shortfalls;
        if discovered.access_denied {
            return Ok(self.aborted_outcome(
                run_id,
                run_metrics,
                shortfalls,
                Vec::new(),
                AbortReason::AccessDenied,
            ));
        }
        if let Some(reason) = self.barrier_abort(&cancel) {
            return Ok(self.aborted_outcome(run_id, run_metrics, shortfalls, Vec::new(), reason));
        }

        // Dedup gate: one batched existence check against the store
        let unseen = self.gate.filter_unseen(discovered.tenders).await?;

        // Stage 2: heuristic quick filter (zero network)
        let input = unseen.len();
        self.stage_started(run_id, Stage::Heuristic, input);
        let started = Instant::now();
        let admitted = heuristic::run(&self.scorer, &self.cache, &self.config, unseen);
        self.finalize_stage(
            &mut run_metrics,
            run_id,
            Stage::Heuristic,
            input,
            admitted.len(),
            started,
        );

        if let Some(reason) = self.barrier_abort(&cancel) {
            return Ok(self.aborted_outcome(run_id, run_metrics, shortfalls, Vec::new(), reason));
        }

        // Stage 3: sample validation
        let input = admitted.len();
        self.stage_started(run_id, Stage::Sampling, input);
        let started = Instant::now();
        let sampled = sampling::run(
            &self.client,
            &self.scorer,
            &self.cache,
            &self.config,
            admitted,
        )
        .await;
        self.finalize_stage(
            &mut run_metrics,
            run_id,
            Stage::Sampling,
            input,
            sampled.confirmed.len(),
            started,
        );

        if sampled.access_denied {
            let failed = not_attempted(sampled.confirmed);
            return Ok(self.aborted_outcome(
                run_id,
                run_metrics,
                shortfalls,
                failed,
                AbortReason::AccessDenied,
            ));
        }
        if let Some(reason) = self.barrier_abort(&cancel) {
            let failed = not_attempted(sampled.confirmed);
            return Ok(self.aborted_outcome(run_id, run_metrics, shortfalls, failed, reason));
        }

        // Stage 4: full materialization (value-tiered concurrency)
        let input = sampled.confirmed.len();
        self.stage_started(run_id, Stage::Materialization, input);
        let started = Instant::now();
        let materialized = materialize::run(&self.client, &self.scorer, &self.config, sampled.confirmed).await;
        self.finalize_stage(
            &mut run_metrics,
            run_id,
            Stage::Materialization,
            input,
            materialized.materialized.len(),
            started,
        );

        // Persist the confirmed subset; this is what makes the dedup gate
        // filter them on the next run
        for tender in &materialized.materialized {
            tenders::save_tender(
                &self.pool,
                &tender.tender,
                tender.confidence,
                tender.source,
                &tender.items,
            )
            .await?;
        }

        let aborted = materialized.access_denied.then_some(AbortReason::AccessDenied);
        if let Some(reason) = &aborted {
            warn!(run_id = %run_id, %reason, "Run finished early");
            let _ = self.events.send(HarvestEvent::RunAborted {
                run_id,
                reason: reason.to_string(),
            });
        }

        let outcome = HarvestOutcome {
            run_id,
            confirmed: materialized.materialized,
            failed: materialized.failed,
            shortfalls: std::mem::take(&mut shortfalls),
            aborted,
            metrics: run_metrics,
        };

        info!(
            run_id = %run_id,
            confirmed = outcome.confirmed.len(),
            failed = outcome.failed.len(),
            shortfalls = outcome.shortfalls.len(),
            total_api_calls = outcome.metrics.total_api_calls(),
            "Harvest run complete"
        );
        let _ = self.events.send(HarvestEvent::RunCompleted {
            run_id,
            confirmed: outcome.confirmed.len(),
            failed: outcome.failed.len(),
            total_api_calls: outcome.metrics.total_api_calls(),
        });

        Ok(outcome)
    }

    /// Cancellation and breaker exhaustion are only honored between stages
    fn barrier_abort(&self, cancel: &CancellationToken) -> Option<AbortReason> {
        if cancel.is_cancelled() {
            return Some(AbortReason::Cancelled);
        }
        if self.client.breaker_state() == BreakerState::Open {
            return Some(AbortReason::BreakerExhausted);
        }
        None
    }

    fn stage_started(&self, run_id: Uuid, stage: Stage, input: usize) {
        self.hub.set_stage(stage);
        info!(run_id = %run_id, stage = stage.label(), input, "Stage started");
        let _ = self.events.send(HarvestEvent::StageStarted {
            run_id,
            stage,
            input,
        });
    }

    fn finalize_stage(
        &self,
        run_metrics: &mut RunMetrics,
        run_id: Uuid,
        stage: Stage,
        input: usize,
        output: usize,
        started: Instant,
    ) {
        let stage_metrics = StageMetrics {
            stage,
            input,
            output,
            api_calls: self.hub.calls_for(stage),
            failures: self.hub.failures_for(stage),
            duration: started.elapsed(),
        };

        info!(
            run_id = %run_id,
            stage = stage.label(),
            input,
            output,
            api_calls = stage_metrics.api_calls,
            failures = stage_metrics.failures,
            reduction_percent = format!("{:.1}", stage_metrics.reduction_percent()),
            "Stage complete"
        );
        let _ = self.events.send(HarvestEvent::StageCompleted {
            run_id,
            stage,
            input,
            output,
            api_calls: stage_metrics.api_calls,
            duration_ms: stage_metrics.duration.as_millis() as u64,
        });

        run_metrics.stages.push(stage_metrics);
    }

    fn aborted_outcome(
        &self,
        run_id: Uuid,
        run_metrics: RunMetrics,
        shortfalls: Vec<Shortfall>,
        failed: Vec<FailedTender>,
        reason: AbortReason,
    ) -> HarvestOutcome {
        warn!(run_id = %run_id, %reason, "Run aborted between stages, returning partial results");
        let _ = self.events.send(HarvestEvent::RunAborted {
            run_id,
            reason: reason.to_string(),
        });

        HarvestOutcome {
            run_id,
            confirmed: Vec::new(),
            failed,
            shortfalls,
            aborted: Some(reason),
            metrics: run_metrics,
        }
    }
}

fn not_attempted(confirmed: Vec<ConfirmedTender>) -> Vec<FailedTender> {
    confirmed
        .into_iter()
        .map(|tender| FailedTender {
            control_number: tender.tender.control_number,
            error: "not attempted: run halted".to_string(),
        })
        .collect()
}
