//! Run progress events.
//!
//! Incremental ray text and pipeline transitions are pushed over a
//! broadcast channel so front-ends can render progress without polling;
//! `status()` snapshots remain available for callers that prefer to poll.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::catalog::UserInputKind;
use crate::scatter::RayState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    /// A ray's state or accumulated text changed. `text_len` grows
    /// monotonically for one ray within one run.
    #[serde(rename_all = "camelCase")]
    RayUpdated {
        run_id: String,
        ray_index: usize,
        state: RayState,
        text_len: usize,
    },

    #[serde(rename_all = "camelCase")]
    ScatterCompleted {
        run_id: String,
        done: usize,
        errored: usize,
        aborted: usize,
    },

    #[serde(rename_all = "camelCase")]
    StepStarted {
        run_id: String,
        step: usize,
        label: String,
    },

    #[serde(rename_all = "camelCase")]
    StepCompleted { run_id: String, step: usize },

    #[serde(rename_all = "camelCase")]
    AwaitingUserInput {
        run_id: String,
        step: usize,
        kind: UserInputKind,
        label: String,
    },

    #[serde(rename_all = "camelCase")]
    RunCompleted { run_id: String },

    #[serde(rename_all = "camelCase")]
    RunFailed { run_id: String, reason: String },

    #[serde(rename_all = "camelCase")]
    RunAborted { run_id: String },
}

/// Broadcast fan-out of [`RunEvent`]s. Cheap to clone; emitting without
/// subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: RunEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
