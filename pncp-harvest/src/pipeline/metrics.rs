//! Per-stage pipeline metrics
//!
//! Stages own their input/output counts and durations; call counts are
//! accumulated by the shared client through the [`MetricsHub`], which tracks
//! which stage is active. The orchestrator sets the active stage at each
//! barrier, finalizes a [`StageMetrics`] when the stage ends, and the
//! finalized records are immutable from then on.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Pipeline stages, in barrier order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Heuristic,
    Sampling,
    Materialization,
}

pub const STAGE_COUNT: usize = 4;

impl Stage {
    pub fn index(&self) -> usize {
        match self {
            Stage::Discovery => 0,
            Stage::Heuristic => 1,
            Stage::Sampling => 2,
            Stage::Materialization => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Discovery => "bulk discovery",
            Stage::Heuristic => "heuristic filter",
            Stage::Sampling => "sample validation",
            Stage::Materialization => "full materialization",
        }
    }
}

/// Shared call/failure accounting, incremented by the client for whichever
/// stage is currently active. Atomic so concurrent stage tasks can record
/// without coordination.
#[derive(Debug, Default)]
pub struct MetricsHub {
    active: AtomicUsize,
    calls: [AtomicU64; STAGE_COUNT],
    failures: [AtomicU64; STAGE_COUNT],
}

impl MetricsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the orchestrator at each stage barrier
    pub fn set_stage(&self, stage: Stage) {
        self.active.store(stage.index(), Ordering::Release);
    }

    pub fn record_call(&self) {
        let idx = self.active.load(Ordering::Acquire);
        self.calls[idx].fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_failure(&self) {
        let idx = self.active.load(Ordering::Acquire);
        self.failures[idx].fetch_add(1, Ordering::AcqRel);
    }

    pub fn calls_for(&self, stage: Stage) -> u64 {
        self.calls[stage.index()].load(Ordering::Acquire)
    }

    pub fn failures_for(&self, stage: Stage) -> u64 {
        self.failures[stage.index()].load(Ordering::Acquire)
    }
}

/// Finalized metrics for one stage of one run
#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub stage: Stage,
    pub input: usize,
    pub output: usize,
    pub api_calls: u64,
    pub failures: u64,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl StageMetrics {
    /// Percentage of input filtered out by this stage
    pub fn reduction_percent(&self) -> f64 {
        if self.input == 0 {
            return 0.0;
        }
        (self.input.saturating_sub(self.output)) as f64 / self.input as f64 * 100.0
    }
}

/// Complete metrics for one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub stages: Vec<StageMetrics>,
}

impl RunMetrics {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            stages: Vec::with_capacity(STAGE_COUNT),
        }
    }

    pub fn total_api_calls(&self) -> u64 {
        self.stages.iter().map(|s| s.api_calls).sum()
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Final results per external call; the number the whole pipeline
    /// design optimizes
    pub fn efficiency(&self) -> f64 {
        let calls = self.total_api_calls();
        if calls == 0 {
            return 0.0;
        }
        let final_output = self.stages.last().map(|s| s.output).unwrap_or(0);
        final_output as f64 / calls as f64
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageMetrics> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
