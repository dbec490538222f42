//! Undo/redo history of host actions
//!
//! A bounded, branching log: recording after an undo discards the redo path,
//! and the oldest record falls off once the ring is full. Each record holds
//! the state captured before the action; the state after it is captured a
//! short delay later, so redo of the newest action is briefly unavailable.
//!
//! Record, undo and redo are serialized by an in-flight flag rather than the
//! state lock. The host's import runs without any lock held, so a reentrant
//! call from inside an apply is rejected instead of deadlocking.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::capture::{ApplyPolicy, StateCapture, StateSnapshot};
use crate::error::{RecoveryError, Result};
use crate::events::{EventBus, RecoveryEvent};
use crate::schedule::spawn_delayed;

/// An action reported by the host
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub action_type: String,
    pub subtype: Option<String>,
    pub data: Option<Value>,
    /// Actions the host cannot roll back are recorded but never undone
    pub undoable: bool,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            subtype: None,
            data: None,
            undoable: true,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_undoable(mut self) -> Self {
        self.undoable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Game,
    Ui,
    Player,
    Scene,
    System,
}

impl ActionCategory {
    pub fn classify(action_type: &str) -> Self {
        let t = action_type.to_lowercase();
        if t.contains("bubble") || t.contains("game") {
            ActionCategory::Game
        } else if t.contains("ui") || t.contains("button") {
            ActionCategory::Ui
        } else if t.contains("player") || t.contains("user") {
            ActionCategory::Player
        } else if t.contains("scene") || t.contains("screen") {
            ActionCategory::Scene
        } else {
            ActionCategory::System
        }
    }
}

/// Rough size of an action's effect on host state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactEstimate {
    Minimal,
    Medium,
    High,
    Major,
}

impl ImpactEstimate {
    pub fn estimate(action_type: &str) -> Self {
        let t = action_type.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| t.contains(w));
        if any(&["reset", "newgame", "delete", "clear"]) {
            ImpactEstimate::Major
        } else if any(&["move", "pop", "score", "level"]) {
            ImpactEstimate::High
        } else if any(&["ui", "setting", "sound"]) {
            ImpactEstimate::Medium
        } else {
            ImpactEstimate::Minimal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub id: u64,
    pub action_type: String,
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub recorded_at: DateTime<Utc>,
    pub state_before: StateSnapshot,
    /// None until the delayed capture runs
    pub state_after: Option<StateSnapshot>,
    pub is_critical: bool,
    pub can_undo: bool,
    pub category: ActionCategory,
    pub impact: ImpactEstimate,
}

impl ActionRecord {
    fn state_bytes(&self) -> u64 {
        self.state_before.size_bytes()
            + self.state_after.as_ref().map(|s| s.size_bytes()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    pub max_history: usize,
    /// Delay before the post-action state is captured
    pub after_capture_delay: Duration,
    /// Action types never recorded
    pub ignored_actions: BTreeSet<String>,
    /// Action types flagged critical
    pub critical_actions: BTreeSet<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let set = |items: &[&str]| -> BTreeSet<String> {
            items.iter().map(|s| s.to_string()).collect()
        };
        Self {
            max_history: 10,
            after_capture_delay: Duration::from_millis(100),
            ignored_actions: set(&["move", "hover", "focus", "scroll", "mouseover", "mouseout"]),
            critical_actions: set(&["reset", "newGame", "delete", "clear", "restart", "quit"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(u64),
    /// Ignored type, recording suspended, or history disabled
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { record_id: u64 },
    /// Nothing to undo or redo from the current position
    Unavailable,
}

impl HistoryOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, HistoryOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStatistics {
    pub total_actions: u64,
    pub undo_count: u64,
    pub redo_count: u64,
    pub history_length: usize,
    pub cursor: isize,
    pub can_undo: bool,
    pub can_redo: bool,
    pub last_action: Option<String>,
    pub average_state_size: u64,
    pub memory_usage_bytes: u64,
}

/// Keyboard chord as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    /// Cmd on macOS; treated like ctrl
    pub meta: bool,
}

impl KeyChord {
    pub fn ctrl(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: true,
            shift: false,
            meta: false,
        }
    }

    pub fn ctrl_shift(key: impl Into<String>) -> Self {
        Self {
            shift: true,
            ..Self::ctrl(key)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    Undo,
    Redo,
}

impl ShortcutAction {
    /// Ctrl+Z undoes; Ctrl+Y and Ctrl+Shift+Z redo
    pub fn for_chord(chord: &KeyChord) -> Option<Self> {
        if !(chord.ctrl || chord.meta) {
            return None;
        }
        match (chord.key.to_lowercase().as_str(), chord.shift) {
            ("z", false) => Some(ShortcutAction::Undo),
            ("z", true) | ("y", false) => Some(ShortcutAction::Redo),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_actions: u64,
    undo_count: u64,
    redo_count: u64,
}

struct HistoryState {
    records: VecDeque<ActionRecord>,
    /// -1 means before the first record
    cursor: isize,
    recording: bool,
    enabled: bool,
    next_id: u64,
    config: HistoryConfig,
    counters: Counters,
}

impl HistoryState {
    fn can_undo(&self) -> bool {
        self.enabled
            && self.cursor >= 0
            && self
                .records
                .get(self.cursor as usize)
                .map(|r| r.can_undo)
                .unwrap_or(false)
    }

    fn can_redo(&self) -> bool {
        self.enabled
            && self.cursor < self.records.len() as isize - 1
            && self
                .records
                .get((self.cursor + 1) as usize)
                .map(|r| r.state_after.is_some())
                .unwrap_or(false)
    }

    fn is_ignored(&self, action_type: &str) -> bool {
        self.config
            .ignored_actions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(action_type))
    }

    fn is_critical(&self, action_type: &str) -> bool {
        self.config
            .critical_actions
            .iter()
            .any(|c| c.eq_ignore_ascii_case(action_type))
    }

    /// Drop oldest records until the ring fits, shifting the cursor with them
    fn enforce_limit(&mut self) {
        let max = self.config.max_history.max(1);
        while self.records.len() > max {
            if let Some(evicted) = self.records.pop_front() {
                tracing::trace!(record_id = evicted.id, "history ring evicted record");
            }
            self.cursor = (self.cursor - 1).max(-1);
        }
    }
}

struct Inner {
    capture: StateCapture,
    events: EventBus,
    state: Mutex<HistoryState>,
    operation_in_progress: AtomicBool,
}

/// Clears the in-flight flag when dropped
struct OperationGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> OperationGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &'static str) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(operation, "history operation rejected, another is in flight");
            return Err(RecoveryError::ConcurrencyRejection { operation });
        }
        Ok(Self { flag })
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ActionHistory {
    inner: Arc<Inner>,
}

impl ActionHistory {
    pub fn new(capture: StateCapture, config: HistoryConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                capture,
                events,
                state: Mutex::new(HistoryState {
                    records: VecDeque::new(),
                    cursor: -1,
                    recording: true,
                    enabled: true,
                    next_id: 1,
                    config,
                    counters: Counters::default(),
                }),
                operation_in_progress: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.inner.lock()
    }

    /// Record an action, capturing the state before it
    pub fn record(&self, action: Action) -> Result<RecordOutcome> {
        let _op = OperationGuard::acquire(&self.inner.operation_in_progress, "record")?;

        {
            let state = self.lock();
            if !state.enabled || !state.recording || state.is_ignored(&action.action_type) {
                return Ok(RecordOutcome::Ignored);
            }
        }

        let before = self.inner.capture.capture()?;
        let recorded_at = self.inner.capture.clock().now_datetime();

        let (id, delay) = {
            let mut state = self.lock();

            // A new action supersedes the redo path
            let keep = (state.cursor + 1) as usize;
            if keep < state.records.len() {
                let discarded = state.records.len() - keep;
                state.records.truncate(keep);
                tracing::debug!(discarded, "truncated redo branch");
            }

            let id = state.next_id;
            state.next_id += 1;
            let is_critical = state.is_critical(&action.action_type);
            state.records.push_back(ActionRecord {
                id,
                category: ActionCategory::classify(&action.action_type),
                impact: ImpactEstimate::estimate(&action.action_type),
                action_type: action.action_type.clone(),
                subtype: action.subtype,
                data: action.data,
                recorded_at,
                state_before: before,
                state_after: None,
                is_critical,
                can_undo: action.undoable,
            });
            state.cursor = state.records.len() as isize - 1;
            state.enforce_limit();
            state.counters.total_actions += 1;

            (id, state.config.after_capture_delay)
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        // Detached: an in-flight capture completes even if the host stops
        spawn_delayed(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.capture_after(id);
            }
        });

        tracing::debug!(record_id = id, action_type = %action.action_type, "action recorded");
        self.inner.events.emit(RecoveryEvent::ActionRecorded {
            record_id: id,
            action_type: action.action_type,
        });
        Ok(RecordOutcome::Recorded(id))
    }

    /// Restore the state before the action at the cursor
    pub fn undo(&self) -> Result<HistoryOutcome> {
        let _op = OperationGuard::acquire(&self.inner.operation_in_progress, "undo")?;

        let (record_id, action_type, before) = {
            let mut state = self.lock();
            if !state.can_undo() {
                return Ok(HistoryOutcome::Unavailable);
            }
            let record = &state.records[state.cursor as usize];
            let taken = (record.id, record.action_type.clone(), record.state_before.clone());
            state.recording = false;
            taken
        };

        let applied = self.inner.capture.apply(&before, ApplyPolicy::Strict);

        let mut state = self.lock();
        state.recording = true;
        if let Err(e) = applied {
            drop(state);
            tracing::warn!(record_id, error = %e, "undo failed, cursor unchanged");
            self.inner
                .events
                .diagnostic("history", format!("undo of record {} failed: {}", record_id, e));
            return Err(e.into());
        }

        let current = state.records.get(state.cursor.max(0) as usize).map(|r| r.id);
        if current == Some(record_id) {
            state.cursor -= 1;
        }
        state.counters.undo_count += 1;
        drop(state);

        tracing::info!(record_id, %action_type, "action undone");
        self.inner.events.emit(RecoveryEvent::ActionUndone {
            record_id,
            action_type,
        });
        Ok(HistoryOutcome::Applied { record_id })
    }

    /// Re-apply the state after the action following the cursor
    pub fn redo(&self) -> Result<HistoryOutcome> {
        let _op = OperationGuard::acquire(&self.inner.operation_in_progress, "redo")?;

        let (record_id, action_type, after) = {
            let mut state = self.lock();
            if !state.can_redo() {
                return Ok(HistoryOutcome::Unavailable);
            }
            let record = &state.records[(state.cursor + 1) as usize];
            let Some(after) = record.state_after.clone() else {
                return Ok(HistoryOutcome::Unavailable);
            };
            let taken = (record.id, record.action_type.clone(), after);
            state.recording = false;
            taken
        };

        let applied = self.inner.capture.apply(&after, ApplyPolicy::Strict);

        let mut state = self.lock();
        state.recording = true;
        if let Err(e) = applied {
            drop(state);
            tracing::warn!(record_id, error = %e, "redo failed, cursor unchanged");
            self.inner
                .events
                .diagnostic("history", format!("redo of record {} failed: {}", record_id, e));
            return Err(e.into());
        }

        let next = state.records.get((state.cursor + 1) as usize).map(|r| r.id);
        if next == Some(record_id) {
            state.cursor += 1;
        }
        state.counters.redo_count += 1;
        drop(state);

        tracing::info!(record_id, %action_type, "action redone");
        self.inner.events.emit(RecoveryEvent::ActionRedone {
            record_id,
            action_type,
        });
        Ok(HistoryOutcome::Applied { record_id })
    }

    /// Undo or redo for a recognised shortcut; None if the chord is not one
    pub fn handle_shortcut(&self, chord: &KeyChord) -> Option<Result<HistoryOutcome>> {
        match ShortcutAction::for_chord(chord)? {
            ShortcutAction::Undo => Some(self.undo()),
            ShortcutAction::Redo => Some(self.redo()),
        }
    }

    pub fn can_undo(&self) -> bool {
        self.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.lock().can_redo()
    }

    pub fn cursor(&self) -> isize {
        self.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first
    pub fn records(&self) -> Vec<ActionRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn find_action(&self, id: u64) -> Option<ActionRecord> {
        self.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn actions_by_type(&self, action_type: &str) -> Vec<ActionRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.action_type == action_type)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) -> Result<()> {
        let _op = OperationGuard::acquire(&self.inner.operation_in_progress, "clear")?;
        let mut state = self.lock();
        state.records.clear();
        state.cursor = -1;
        tracing::info!("action history cleared");
        Ok(())
    }

    pub fn set_recording(&self, recording: bool) {
        self.lock().recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
        tracing::info!(enabled, "action history toggled");
    }

    pub fn config(&self) -> HistoryConfig {
        self.lock().config.clone()
    }

    /// Replace the config; a smaller ring drops the oldest records now
    pub fn update_config(&self, config: HistoryConfig) {
        let mut state = self.lock();
        state.config = config;
        state.enforce_limit();
    }

    pub fn statistics(&self) -> HistoryStatistics {
        let state = self.lock();
        let memory_usage_bytes: u64 = state.records.iter().map(ActionRecord::state_bytes).sum();
        let average_state_size = if state.records.is_empty() {
            0
        } else {
            memory_usage_bytes / state.records.len() as u64
        };

        HistoryStatistics {
            total_actions: state.counters.total_actions,
            undo_count: state.counters.undo_count,
            redo_count: state.counters.redo_count,
            history_length: state.records.len(),
            cursor: state.cursor,
            can_undo: state.can_undo(),
            can_redo: state.can_redo(),
            last_action: state.records.back().map(|r| r.action_type.clone()),
            average_state_size,
            memory_usage_bytes,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fill `state_after` for a record that is still applied
    ///
    /// A record undone, evicted or truncated before the delay elapsed keeps
    /// no after-state.
    fn capture_after(&self, id: u64) {
        let snapshot = match self.capture.capture() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(record_id = id, error = %e, "after-state capture failed");
                self.events
                    .diagnostic("history", format!("after-state capture failed: {}", e));
                return;
            }
        };

        let mut state = self.lock();
        let cursor = state.cursor;
        let Some(pos) = state.records.iter().position(|r| r.id == id) else {
            tracing::trace!(record_id = id, "record gone before after-state capture");
            return;
        };
        if pos as isize > cursor {
            tracing::debug!(record_id = id, "record was undone, skipping after-state");
            return;
        }
        let record = &mut state.records[pos];
        if record.state_after.is_none() {
            record.state_after = Some(snapshot);
        }
    }
}
