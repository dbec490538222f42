//! Checkpoint and recovery for interactive applications
//!
//! Three components share one host application:
//! - [`SnapshotStore`] keeps a bounded, priority-evicting list of full-state
//!   save points plus an emergency slot.
//! - [`ActionHistory`] records user actions with before/after state for
//!   undo and redo.
//! - [`PreventionGuard`] screens clicks for double-clicks, click storms and
//!   destructive targets that need confirmation.
//!
//! [`RecoveryOrchestrator`] wires them to host lifecycle events and owns the
//! periodic autosave timer.

// Time source (system or manual for tests)
pub mod clock;

pub mod error;

// Host state export/import and snapshot validation
pub mod capture;

// Key/value backends and the persisted save layout
pub mod archive;
pub mod models;
pub mod store;

pub mod events;
pub mod schedule;

// Recovery components
pub mod guard;
pub mod history;
pub mod orchestrator;
pub mod snapshot_store;

pub mod config;
pub mod logging;

#[cfg(test)]
mod test_utils;

pub use capture::{CapabilityRegistry, Exportable, HostApplication, StateCapture, StateSnapshot};
pub use config::RecoveryConfig;
pub use error::{RecoveryError, Result};
pub use events::{EventBus, RecoveryEvent};
pub use guard::{ClickDecision, ClickEvent, PreventionGuard, TargetDescriptor};
pub use history::{Action, ActionHistory, KeyChord};
pub use orchestrator::{LifecycleEvent, RecoveryOrchestrator};
pub use snapshot_store::{SaveType, SnapshotStore};
pub use store::{FileStore, MemoryStore, PersistentStore};
