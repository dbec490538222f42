//! Notifications broadcast to the host
//!
//! Every component shares one [`EventBus`]. Sending never blocks and never
//! fails the caller; with no subscribers the event is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::guard::{ClickKind, ConfirmationOutcome};
use crate::snapshot_store::SaveType;

const DEFAULT_CAPACITY: usize = 256;

/// Why a save request did not produce a save point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    Disabled,
    CircuitOpen,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RecoveryEvent {
    SaveCompleted {
        save_id: String,
        save_type: SaveType,
        save_index: u64,
    },
    SaveSkipped {
        save_type: SaveType,
        reason: SkipReason,
    },
    SaveFailed {
        save_type: SaveType,
        message: String,
    },
    /// Every save point was dropped after capacity recovery failed
    StorageCleared,
    Restored {
        save_id: Option<String>,
        partial: bool,
        emergency: bool,
    },
    RestoreFailed {
        save_id: Option<String>,
        message: String,
    },
    ActionRecorded {
        record_id: u64,
        action_type: String,
    },
    ActionUndone {
        record_id: u64,
        action_type: String,
    },
    ActionRedone {
        record_id: u64,
        action_type: String,
    },
    ClickPrevented {
        element_id: String,
        kind: ClickKind,
    },
    ConfirmationRequested {
        element_id: String,
        title: String,
    },
    ConfirmationResolved {
        element_id: String,
        outcome: ConfirmationOutcome,
    },
    ConfirmedActionDispatched {
        element_id: String,
    },
    HighErrorRate {
        recent_errors: usize,
        window_ms: u64,
    },
    /// Low-level notice for failures that were handled locally
    Diagnostic {
        component: String,
        message: String,
    },
}

/// Cloneable handle to the shared broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RecoveryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RecoveryEvent) {
        tracing::trace!(?event, "recovery event");
        let _ = self.tx.send(event);
    }

    pub(crate) fn diagnostic(&self, component: &str, message: impl Into<String>) {
        self.emit(RecoveryEvent::Diagnostic {
            component: component.to_string(),
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain everything currently buffered on a receiver
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<RecoveryEvent>) -> Vec<RecoveryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
