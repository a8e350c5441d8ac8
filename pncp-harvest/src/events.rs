//! Progress events broadcast during a harvest run
//!
//! Fire-and-forget: the orchestrator never blocks on (or fails because of)
//! missing subscribers.

use crate::pipeline::metrics::Stage;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvestEvent {
    RunStarted {
        run_id: Uuid,
        window_start: chrono::NaiveDate,
        window_end: chrono::NaiveDate,
    },
    StageStarted {
        run_id: Uuid,
        stage: Stage,
        input: usize,
    },
    StageCompleted {
        run_id: Uuid,
        stage: Stage,
        input: usize,
        output: usize,
        api_calls: u64,
        duration_ms: u64,
    },
    RunAborted {
        run_id: Uuid,
        reason: String,
    },
    RunCompleted {
        run_id: Uuid,
        confirmed: usize,
        failed: usize,
        total_api_calls: u64,
    },
}

/// Broadcast bus for [`HarvestEvent`]
pub struct EventBus {
    tx: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<HarvestEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.tx.subscribe()
    }
}
