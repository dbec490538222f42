//! Snapshot store: bounded, priority-evicting save points
//!
//! Owns the save-point list and is the sole writer of the archive:
//! - Validity-gated saves (forced saves bypass the gate)
//! - Priority eviction: `(priority desc, captured_at desc)`, top-K survive
//! - Capacity recovery: halve the keep-count, retry once, then clear
//! - Consecutive-failure circuit breaker with cooldown
//! - Emergency slot written on host-reported errors
//! - Checksummed restore with optional validation and partial tolerance

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::{Archive, StorageUsage};
use crate::capture::{
    validate_snapshot, ApplyPolicy, ApplyReport, CapabilityRegistry, StateCapture, ValidationLimits,
};
use crate::error::{RecoveryError, Result};
use crate::events::{EventBus, RecoveryEvent, SkipReason};
use crate::models::{generate_save_id, EmergencyRecord, SaveMetadata, SavePoint};
use crate::store::PersistentStore;

pub use crate::models::SaveType;

/// Breaker thresholds for repeated save failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Number of consecutive failures before saves are skipped
    pub failure_threshold: u32,
    /// How long saves stay skipped once the breaker opens
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; the next save is a probe
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct SaveBreaker {
    config: BreakerConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl SaveBreaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn state(&self, now: Instant) -> BreakerState {
        if self.consecutive_failures < self.config.failure_threshold.max(1) {
            return BreakerState::Closed;
        }
        match self.opened_at {
            Some(opened) if now.duration_since(opened) < self.config.cooldown => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn allows(&self, now: Instant) -> bool {
        self.state(now) != BreakerState::Open
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// A failure while half-open re-opens with a fresh cooldown
    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.config.failure_threshold.max(1) {
            if self.opened_at.is_none() || self.state(now) == BreakerState::HalfOpen {
                tracing::warn!(
                    failures = self.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "save breaker opened"
                );
            }
            self.opened_at = Some(now);
        }
    }

    fn status(&self, now: Instant) -> BreakerStatus {
        let state = self.state(now);
        let cooldown_remaining_ms = match (state, self.opened_at) {
            (BreakerState::Open, Some(opened)) => Some(
                self.config
                    .cooldown
                    .saturating_sub(now.duration_since(opened))
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerStatus {
            state,
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining_ms,
        }
    }
}

/// Tunables for the snapshot store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSettings {
    pub max_save_points: usize,
    pub limits: ValidationLimits,
    pub breaker: BreakerConfig,
    /// Budget used for usage reporting when the backend has no capacity
    pub storage_budget_bytes: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            max_save_points: 5,
            limits: ValidationLimits::default(),
            breaker: BreakerConfig::default(),
            storage_budget_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Bypass the validity gate, the breaker and the enabled flag
    pub force: bool,
}

impl SaveOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Verify checksum and payload before applying
    pub validate: bool,
    /// Continue past validation failures and tolerate partial applies
    pub skip_errors: bool,
    /// Take a manual save of the current state first
    pub backup_current: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            validate: true,
            skip_errors: false,
            backup_current: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { id: String, save_index: u64 },
    Skipped(SkipReason),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// None when restored from the emergency slot
    pub save_point_id: Option<String>,
    pub save_type: Option<SaveType>,
    pub emergency: bool,
    pub apply: ApplyReport,
}

impl RestoreReport {
    pub fn is_partial(&self) -> bool {
        self.apply.is_partial()
    }
}

/// Listing entry for a stored save point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavePointSummary {
    pub id: String,
    pub save_type: SaveType,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub save_index: u64,
    pub priority: u8,
    pub valid: bool,
}

impl SavePointSummary {
    pub fn describe(point: &SavePoint, limits: &ValidationLimits) -> Self {
        Self {
            id: point.id.clone(),
            save_type: point.save_type,
            captured_at: point.captured_at,
            size_bytes: point.size_bytes,
            save_index: point.save_index,
            priority: point.priority(),
            valid: point.verify(limits).is_ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub valid: usize,
    pub invalid: usize,
    /// 1 when invalid points were dropped and the index re-derived
    pub repaired: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveStatistics {
    pub enabled: bool,
    pub save_point_count: usize,
    pub max_save_points: usize,
    pub total_saves: u64,
    pub total_restores: u64,
    pub total_errors: u64,
    pub last_save_at: Option<DateTime<Utc>>,
    pub last_save_type: Option<SaveType>,
    pub next_save_index: u64,
    pub breaker: BreakerStatus,
}

/// Keep the `keep` best save points by eviction order
///
/// Survivors are returned to chronological (index) order. Returns the
/// evicted points.
pub fn retain_top(points: &mut Vec<SavePoint>, keep: usize) -> Vec<SavePoint> {
    if points.len() <= keep {
        return Vec::new();
    }
    points.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then(b.captured_at.cmp(&a.captured_at))
            .then(b.save_index.cmp(&a.save_index))
    });
    let evicted = points.split_off(keep);
    points.sort_by_key(|p| p.save_index);
    evicted
}

/// Best restore candidate: highest priority, then most recent
fn best_candidate(points: &[SavePoint]) -> Option<&SavePoint> {
    points.iter().max_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(a.captured_at.cmp(&b.captured_at))
            .then(a.save_index.cmp(&b.save_index))
    })
}

enum PersistFailure {
    /// Nothing changed in the archive; the caller may roll back
    Plain(RecoveryError),
    /// Capacity recovery ran out of options and cleared the list
    Cleared(RecoveryError),
}

struct StoreState {
    /// Chronological by save_index
    save_points: Vec<SavePoint>,
    metadata: SaveMetadata,
    next_index: u64,
    breaker: SaveBreaker,
    enabled: bool,
    settings: SnapshotSettings,
}

pub struct SnapshotStore {
    capture: StateCapture,
    archive: Archive,
    events: EventBus,
    state: Mutex<StoreState>,
}

impl SnapshotStore {
    /// Open the store over `backend`, loading any persisted save points
    ///
    /// An unreadable archive is logged and treated as empty.
    pub fn open(
        capture: StateCapture,
        backend: Arc<dyn PersistentStore>,
        settings: SnapshotSettings,
        events: EventBus,
    ) -> Self {
        let archive = Archive::new(backend);

        let mut save_points = archive.load_save_points().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding unreadable save-point list");
            events.diagnostic("snapshot_store", format!("unreadable save-point list: {}", e));
            Vec::new()
        });
        let metadata = archive.load_metadata().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding unreadable save metadata");
            events.diagnostic("snapshot_store", format!("unreadable save metadata: {}", e));
            SaveMetadata::default()
        });

        save_points.sort_by_key(|p| p.save_index);
        let next_index = next_index_after(&save_points, &metadata);
        let evicted = retain_top(&mut save_points, settings.max_save_points);

        tracing::info!(
            save_points = save_points.len(),
            next_index,
            "snapshot store opened"
        );

        let store = Self {
            capture,
            archive,
            events,
            state: Mutex::new(StoreState {
                save_points,
                metadata,
                next_index,
                breaker: SaveBreaker::new(settings.breaker.clone()),
                enabled: true,
                settings,
            }),
        };

        if !evicted.is_empty() {
            let mut state = store.lock();
            if let Err(failure) = store.persist_points(&mut state) {
                let (PersistFailure::Plain(e) | PersistFailure::Cleared(e)) = failure;
                tracing::warn!(error = %e, "failed to persist trimmed save points");
            }
        }

        store
    }

    /// Open over `backend` with no host behind it
    ///
    /// Listing, deletion, clearing and validation behave as they do for a
    /// live host; saves capture an empty snapshot.
    pub fn open_detached(backend: Arc<dyn PersistentStore>, settings: SnapshotSettings) -> Self {
        let capture = StateCapture::new(Arc::new(CapabilityRegistry::new()));
        Self::open(capture, backend, settings, EventBus::new())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> Instant {
        self.capture.clock().now()
    }

    pub fn capture(&self) -> &StateCapture {
        &self.capture
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Save and report success as a flag
    pub fn perform_save(&self, save_type: SaveType, options: SaveOptions) -> bool {
        match self.save(save_type, options) {
            Ok(outcome) => outcome.is_saved(),
            Err(e) => {
                tracing::debug!(%save_type, error = %e, "save failed");
                false
            }
        }
    }

    /// Capture, validate, append, evict and persist one save point
    ///
    /// The host is exported before the store lock is taken, so an exporter
    /// may itself report an error (and trigger an emergency save).
    pub fn save(&self, save_type: SaveType, options: SaveOptions) -> Result<SaveOutcome> {
        {
            let state = self.lock();
            if !state.enabled && !options.force {
                drop(state);
                return Ok(self.skip(save_type, SkipReason::Disabled));
            }
            let now = self.now();
            if !options.force && !state.breaker.allows(now) {
                drop(state);
                tracing::debug!(%save_type, "save skipped, breaker open");
                return Ok(self.skip(save_type, SkipReason::CircuitOpen));
            }
        }

        let captured = self.capture.capture();
        let mut state = self.lock();
        let snapshot = match captured {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_failure(&mut state, save_type, &e);
                return Err(e);
            }
        };

        match validate_snapshot(&snapshot, &state.settings.limits) {
            Ok(report) => {
                for warning in &report.warnings {
                    tracing::debug!(%save_type, %warning, "snapshot validation warning");
                }
            }
            Err(e) if !options.force => {
                tracing::warn!(%save_type, error = %e, "rejecting invalid snapshot");
                return Ok(self.skip(save_type, SkipReason::Invalid(e.to_string())));
            }
            Err(e) => {
                tracing::warn!(%save_type, error = %e, "forcing save of invalid snapshot");
            }
        }

        // Indices are consumed here and never handed out again, even if
        // persistence below fails.
        let save_index = state.next_index;
        state.next_index += 1;

        let id = generate_save_id(snapshot.captured_at);
        let point = match SavePoint::new(id.clone(), save_type, snapshot, save_index) {
            Ok(point) => point,
            Err(e) => {
                let err = RecoveryError::from(e);
                self.record_failure(&mut state, save_type, &err);
                return Err(err);
            }
        };

        let previous = state.save_points.clone();
        state.save_points.push(point);
        let max = state.settings.max_save_points;
        for evicted in retain_top(&mut state.save_points, max) {
            tracing::debug!(
                save_id = %evicted.id,
                save_type = %evicted.save_type,
                save_index = evicted.save_index,
                "evicted save point"
            );
        }

        if let Err(failure) = self.persist_points(&mut state) {
            let err = match failure {
                PersistFailure::Plain(e) => {
                    state.save_points = previous;
                    e
                }
                PersistFailure::Cleared(e) => e,
            };
            self.record_failure(&mut state, save_type, &err);
            return Err(err);
        }

        state.metadata.total_saves += 1;
        state.metadata.last_save_at = Some(self.capture.clock().now_datetime());
        state.metadata.last_save_type = Some(save_type);
        state.metadata.last_save_index = Some(save_index);
        self.persist_metadata(&state.metadata);
        state.breaker.record_success();

        tracing::info!(save_id = %id, %save_type, save_index, "save point written");
        self.events.emit(RecoveryEvent::SaveCompleted {
            save_id: id.clone(),
            save_type,
            save_index,
        });

        Ok(SaveOutcome::Saved { id, save_index })
    }

    fn skip(&self, save_type: SaveType, reason: SkipReason) -> SaveOutcome {
        self.events.emit(RecoveryEvent::SaveSkipped {
            save_type,
            reason: reason.clone(),
        });
        SaveOutcome::Skipped(reason)
    }

    fn record_failure(&self, state: &mut StoreState, save_type: SaveType, err: &RecoveryError) {
        state.breaker.record_failure(self.now());
        state.metadata.total_errors += 1;
        self.persist_metadata(&state.metadata);
        tracing::warn!(
            %save_type,
            error = %err,
            consecutive_failures = state.breaker.consecutive_failures,
            "save failed"
        );
        self.events.emit(RecoveryEvent::SaveFailed {
            save_type,
            message: err.to_string(),
        });
    }

    fn persist_metadata(&self, metadata: &SaveMetadata) {
        if let Err(e) = self.archive.store_metadata(metadata) {
            tracing::debug!(error = %e, "failed to persist save metadata");
            self.events
                .diagnostic("snapshot_store", format!("metadata write failed: {}", e));
        }
    }

    fn persist_points(&self, state: &mut StoreState) -> std::result::Result<(), PersistFailure> {
        let err = match self.archive.store_save_points(&state.save_points) {
            Ok(()) => return Ok(()),
            Err(e @ RecoveryError::CapacityExceeded { .. }) => e,
            Err(e) => return Err(PersistFailure::Plain(e)),
        };

        let keep = (state.settings.max_save_points / 2).max(1);
        tracing::warn!(error = %err, keep, "storage full, trimming save points and retrying");
        retain_top(&mut state.save_points, keep);

        match self.archive.store_save_points(&state.save_points) {
            Ok(()) => Ok(()),
            Err(retry_err) => {
                tracing::error!(error = %retry_err, "retry failed, clearing all save points");
                state.save_points.clear();
                if let Err(e) = self.archive.clear_save_points() {
                    tracing::warn!(error = %e, "failed to remove save-point list");
                }
                self.events.emit(RecoveryEvent::StorageCleared);
                Err(PersistFailure::Cleared(retry_err))
            }
        }
    }

    /// Restore a specific save point into the host
    pub fn restore_from_save_point(&self, id: &str, options: RestoreOptions) -> Result<RestoreReport> {
        let point = self
            .get_save_point(id)
            .ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;
        self.restore_point(point, options)
    }

    /// Restore the highest-priority, most recent save point
    pub fn restore_latest(&self, options: RestoreOptions) -> Result<RestoreReport> {
        let point = {
            let state = self.lock();
            best_candidate(&state.save_points).cloned()
        }
        .ok_or_else(|| RecoveryError::NotFound("no save points".to_string()))?;
        self.restore_point(point, options)
    }

    fn restore_point(&self, point: SavePoint, options: RestoreOptions) -> Result<RestoreReport> {
        let limits = self.lock().settings.limits;

        if options.validate {
            if let Err(e) = point.verify(&limits) {
                if !options.skip_errors {
                    tracing::warn!(save_id = %point.id, error = %e, "refusing to restore invalid save point");
                    self.events.emit(RecoveryEvent::RestoreFailed {
                        save_id: Some(point.id.clone()),
                        message: e.to_string(),
                    });
                    return Err(e.into());
                }
                tracing::warn!(save_id = %point.id, error = %e, "restoring despite failed validation");
            }
        }

        if options.backup_current && !self.perform_save(SaveType::Manual, SaveOptions::default()) {
            tracing::warn!(save_id = %point.id, "backup before restore did not complete");
        }

        let policy = if options.skip_errors {
            ApplyPolicy::BestEffort
        } else {
            ApplyPolicy::Strict
        };

        match self.capture.apply(&point.snapshot, policy) {
            Ok(apply) => {
                self.finish_restore(Some(&point.id), false, apply.is_partial());
                Ok(RestoreReport {
                    save_point_id: Some(point.id),
                    save_type: Some(point.save_type),
                    emergency: false,
                    apply,
                })
            }
            Err(e) => {
                self.fail_restore(Some(&point.id), &e.to_string());
                Err(e.into())
            }
        }
    }

    fn finish_restore(&self, save_id: Option<&str>, emergency: bool, partial: bool) {
        {
            let mut state = self.lock();
            state.metadata.total_restores += 1;
            self.persist_metadata(&state.metadata);
        }
        tracing::info!(save_id = ?save_id, emergency, partial, "state restored");
        self.events.emit(RecoveryEvent::Restored {
            save_id: save_id.map(str::to_string),
            partial,
            emergency,
        });
    }

    fn fail_restore(&self, save_id: Option<&str>, message: &str) {
        {
            let mut state = self.lock();
            state.metadata.total_errors += 1;
            self.persist_metadata(&state.metadata);
        }
        tracing::error!(save_id = ?save_id, error = %message, "restore failed");
        self.events.emit(RecoveryEvent::RestoreFailed {
            save_id: save_id.map(str::to_string),
            message: message.to_string(),
        });
    }

    /// Force an emergency save and refresh the emergency slot
    ///
    /// Returns whether the emergency save point was written. The slot is
    /// written independently so it survives a failing save path.
    pub fn record_emergency(&self, error_message: &str) -> bool {
        let saved = self.perform_save(SaveType::Emergency, SaveOptions::forced());

        let written = self.capture.capture().and_then(|snapshot| {
            let record = EmergencyRecord::new(
                snapshot,
                error_message.to_string(),
                self.capture.clock().now_datetime(),
            )?;
            let _state = self.lock();
            self.archive.store_emergency(&record)
        });

        if let Err(e) = written {
            tracing::error!(error = %e, "failed to write emergency slot");
            self.events
                .diagnostic("snapshot_store", format!("emergency slot write failed: {}", e));
        }

        saved
    }

    /// Restore from the emergency slot, falling back to the best save point
    pub fn perform_emergency_restore(&self) -> Result<RestoreReport> {
        let limits = self.lock().settings.limits;

        match self.archive.load_emergency() {
            Ok(Some(record)) => match record.verify(&limits) {
                Ok(_) => match self.capture.apply(&record.snapshot, ApplyPolicy::BestEffort) {
                    Ok(apply) => {
                        self.finish_restore(None, true, apply.is_partial());
                        return Ok(RestoreReport {
                            save_point_id: None,
                            save_type: None,
                            emergency: true,
                            apply,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "emergency slot apply failed, falling back")
                    }
                },
                Err(e) => tracing::warn!(error = %e, "emergency slot invalid, falling back"),
            },
            Ok(None) => tracing::debug!("no emergency slot, falling back to latest save point"),
            Err(e) => tracing::warn!(error = %e, "emergency slot unreadable, falling back"),
        }

        let mut report = self.restore_latest(RestoreOptions {
            validate: false,
            skip_errors: true,
            backup_current: false,
        })?;
        report.emergency = true;
        Ok(report)
    }

    pub fn get_save_point(&self, id: &str) -> Option<SavePoint> {
        self.lock().save_points.iter().find(|p| p.id == id).cloned()
    }

    /// Save points, newest first
    pub fn list_save_points(&self) -> Vec<SavePointSummary> {
        let state = self.lock();
        let limits = state.settings.limits;
        state
            .save_points
            .iter()
            .rev()
            .map(|p| SavePointSummary::describe(p, &limits))
            .collect()
    }

    pub fn save_point_count(&self) -> usize {
        self.lock().save_points.len()
    }

    /// Remove one save point; returns false if it did not exist
    pub fn delete_save_point(&self, id: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(pos) = state.save_points.iter().position(|p| p.id == id) else {
            return Ok(false);
        };
        let previous = state.save_points.clone();
        state.save_points.remove(pos);
        if let Err(e) = self.archive.store_save_points(&state.save_points) {
            state.save_points = previous;
            return Err(e);
        }
        tracing::info!(save_id = %id, "deleted save point");
        Ok(true)
    }

    /// Drop every save point and the emergency slot
    ///
    /// The index keeps counting from where it was.
    pub fn clear_all_save_points(&self) -> Result<()> {
        let mut state = self.lock();
        state.save_points.clear();
        self.archive.clear_save_points()?;
        self.archive.clear_emergency()?;
        self.persist_metadata(&state.metadata);
        tracing::info!("cleared all save points");
        Ok(())
    }

    /// Re-verify every save point, dropping the ones that fail
    pub fn validate_all_save_points(&self) -> Result<ValidationSummary> {
        let mut state = self.lock();
        let limits = state.settings.limits;

        let mut summary = ValidationSummary::default();
        let mut kept = Vec::with_capacity(state.save_points.len());
        for point in state.save_points.drain(..) {
            match point.verify(&limits) {
                Ok(_) => {
                    summary.valid += 1;
                    kept.push(point);
                }
                Err(e) => {
                    tracing::warn!(save_id = %point.id, error = %e, "dropping invalid save point");
                    summary.invalid += 1;
                }
            }
        }
        state.save_points = kept;

        if summary.invalid > 0 {
            let repaired = next_index_after(&state.save_points, &state.metadata);
            state.next_index = state.next_index.max(repaired);
            summary.repaired = 1;
        }

        self.archive.store_save_points(&state.save_points)?;
        Ok(summary)
    }

    pub fn storage_usage(&self) -> Result<StorageUsage> {
        let budget = self.lock().settings.storage_budget_bytes;
        self.archive.usage(budget)
    }

    pub fn statistics(&self) -> SaveStatistics {
        let state = self.lock();
        SaveStatistics {
            enabled: state.enabled,
            save_point_count: state.save_points.len(),
            max_save_points: state.settings.max_save_points,
            total_saves: state.metadata.total_saves,
            total_restores: state.metadata.total_restores,
            total_errors: state.metadata.total_errors,
            last_save_at: state.metadata.last_save_at,
            last_save_type: state.metadata.last_save_type,
            next_save_index: state.next_index,
            breaker: state.breaker.status(self.now()),
        }
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.lock().breaker.status(self.now())
    }

    pub fn settings(&self) -> SnapshotSettings {
        self.lock().settings.clone()
    }

    /// Replace the settings, trimming immediately if the maximum shrank
    pub fn update_settings(&self, settings: SnapshotSettings) {
        let mut state = self.lock();
        state.breaker.config = settings.breaker.clone();
        let max = settings.max_save_points;
        state.settings = settings;

        if !retain_top(&mut state.save_points, max).is_empty() {
            if let Err(failure) = self.persist_points(&mut state) {
                let (PersistFailure::Plain(e) | PersistFailure::Cleared(e)) = failure;
                tracing::warn!(error = %e, "failed to persist trimmed save points");
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
        tracing::info!(enabled, "autosave toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }
}

fn next_index_after(points: &[SavePoint], metadata: &SaveMetadata) -> u64 {
    let from_points = points.iter().map(|p| p.save_index + 1).max().unwrap_or(0);
    let from_metadata = metadata.last_save_index.map(|i| i + 1).unwrap_or(0);
    from_points.max(from_metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, EMERGENCY_KEY};
    use crate::capture::{CapabilityRegistry, HostApplication};
    use crate::clock::ManualClock;
    use crate::error::ValidationError;
    use crate::events::drain;
    use crate::store::MemoryStore;
    use crate::test_utils::{FlakyStore, GameHost};
    use std::sync::Arc;

    struct Fixture {
        host: GameHost,
        clock: ManualClock,
        backend: Arc<FlakyStore>,
        events: EventBus,
        store: SnapshotStore,
    }

    fn fixture_with(settings: SnapshotSettings) -> Fixture {
        let host = GameHost::new();
        let clock = ManualClock::new();
        let backend = Arc::new(FlakyStore::new());
        let events = EventBus::new();
        let capture = StateCapture::with_clock(host.registry(), Arc::new(clock.clone()));
        let store = SnapshotStore::open(capture, backend.clone(), settings, events.clone());
        Fixture {
            host,
            clock,
            backend,
            events,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SnapshotSettings::default())
    }

    fn with_max(max: usize) -> SnapshotSettings {
        SnapshotSettings {
            max_save_points: max,
            ..SnapshotSettings::default()
        }
    }

    fn reopen(f: &Fixture) -> SnapshotStore {
        let capture = StateCapture::with_clock(f.host.registry(), Arc::new(f.clock.clone()));
        SnapshotStore::open(capture, f.backend.clone(), f.store.settings(), EventBus::new())
    }

    fn types(store: &SnapshotStore) -> Vec<(SaveType, u64)> {
        let mut points: Vec<_> = store
            .list_save_points()
            .into_iter()
            .map(|p| (p.save_type, p.save_index))
            .collect();
        points.sort_by_key(|(_, i)| *i);
        points
    }

    #[test]
    fn save_appends_and_persists() {
        let f = fixture();
        let mut rx = f.events.subscribe();

        assert!(f.store.perform_save(SaveType::Manual, SaveOptions::default()));

        let persisted = Archive::new(f.backend.clone()).load_save_points().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].save_type, SaveType::Manual);
        assert_eq!(persisted[0].save_index, 0);

        let stats = f.store.statistics();
        assert_eq!(stats.total_saves, 1);
        assert_eq!(stats.last_save_type, Some(SaveType::Manual));
        assert_eq!(stats.next_save_index, 1);

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [RecoveryEvent::SaveCompleted { save_type: SaveType::Manual, save_index: 0, .. }]
        ));
    }

    #[test]
    fn invalid_snapshot_is_rejected_without_side_effects() {
        let events = EventBus::new();
        let backend = Arc::new(MemoryStore::new());
        // A registry with no capabilities exports an empty payload
        let capture = StateCapture::new(Arc::new(CapabilityRegistry::new()));
        let store = SnapshotStore::open(
            capture,
            backend.clone(),
            SnapshotSettings::default(),
            events.clone(),
        );

        let outcome = store.save(SaveType::Periodic, SaveOptions::default()).unwrap();

        assert!(matches!(outcome, SaveOutcome::Skipped(SkipReason::Invalid(_))));
        assert_eq!(store.save_point_count(), 0);
        let stats = store.statistics();
        assert_eq!(stats.total_saves, 0);
        assert_eq!(stats.total_errors, 0);
        assert_eq!(stats.next_save_index, 0);
        assert!(backend.is_empty());
    }

    #[test]
    fn forced_save_bypasses_validation() {
        let capture = StateCapture::new(Arc::new(CapabilityRegistry::new()));
        let store = SnapshotStore::open(
            capture,
            Arc::new(MemoryStore::new()),
            SnapshotSettings::default(),
            EventBus::new(),
        );

        assert!(store.perform_save(SaveType::Emergency, SaveOptions::forced()));
        let listed = store.list_save_points();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].valid);
    }

    #[test]
    fn disabled_store_skips_unforced_saves() {
        let f = fixture();
        f.store.set_enabled(false);

        assert_eq!(
            f.store.save(SaveType::Periodic, SaveOptions::default()).unwrap(),
            SaveOutcome::Skipped(SkipReason::Disabled)
        );
        assert!(f.store.perform_save(SaveType::Final, SaveOptions::forced()));
        assert_eq!(f.store.save_point_count(), 1);
    }

    #[test]
    fn emergency_outlives_newer_periodic_saves() {
        let f = fixture_with(with_max(3));
        for save_type in [
            SaveType::Periodic,
            SaveType::Periodic,
            SaveType::Emergency,
            SaveType::Periodic,
        ] {
            assert!(f.store.perform_save(save_type, SaveOptions::default()));
            f.clock.advance(Duration::from_secs(1));
        }

        assert_eq!(
            types(&f.store),
            vec![
                (SaveType::Periodic, 1),
                (SaveType::Emergency, 2),
                (SaveType::Periodic, 3),
            ]
        );
    }

    #[test]
    fn eviction_prefers_recency_among_equal_priority() {
        let f = fixture_with(with_max(2));
        for _ in 0..5 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        }
        // Same timestamp throughout, so the index breaks the tie
        assert_eq!(
            types(&f.store),
            vec![(SaveType::Periodic, 3), (SaveType::Periodic, 4)]
        );
    }

    #[test]
    fn capacity_exceeded_halves_and_retries() {
        let f = fixture_with(with_max(4));
        for _ in 0..4 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
            f.clock.advance(Duration::from_secs(1));
        }

        f.backend.full_for_next_writes(1);
        assert!(f.store.perform_save(SaveType::Manual, SaveOptions::default()));

        // keep = max(1, 4 / 2) = 2: the manual save and the newest periodic
        assert_eq!(
            types(&f.store),
            vec![(SaveType::Periodic, 3), (SaveType::Manual, 4)]
        );
        let persisted = Archive::new(f.backend.clone()).load_save_points().unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[test]
    fn failed_capacity_retry_clears_everything() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.store.perform_save(SaveType::Periodic, SaveOptions::default());

        f.backend.full_for_next_writes(2);
        let err = f
            .store
            .save(SaveType::Periodic, SaveOptions::default())
            .unwrap_err();

        assert!(matches!(err, RecoveryError::CapacityExceeded { .. }));
        assert_eq!(f.store.save_point_count(), 0);
        assert!(Archive::new(f.backend.clone())
            .load_save_points()
            .unwrap()
            .is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, RecoveryEvent::StorageCleared)));

        // The index keeps climbing after a clear
        assert!(f.store.perform_save(SaveType::Periodic, SaveOptions::default()));
        assert_eq!(types(&f.store), vec![(SaveType::Periodic, 2)]);
    }

    #[test]
    fn io_failure_rolls_back_list_but_not_index() {
        let f = fixture();
        f.store.perform_save(SaveType::Periodic, SaveOptions::default());

        f.backend.fail_next_writes(1);
        assert!(!f.store.perform_save(SaveType::Manual, SaveOptions::default()));
        assert_eq!(types(&f.store), vec![(SaveType::Periodic, 0)]);
        assert_eq!(f.store.statistics().total_errors, 1);

        assert!(f.store.perform_save(SaveType::Manual, SaveOptions::default()));
        assert_eq!(
            types(&f.store),
            vec![(SaveType::Periodic, 0), (SaveType::Manual, 2)]
        );
    }

    #[test]
    fn breaker_opens_after_consecutive_failures_and_recovers() {
        let f = fixture();
        f.backend.fail_next_writes(100);

        for _ in 0..3 {
            assert!(matches!(
                f.store.save(SaveType::Periodic, SaveOptions::default()),
                Err(RecoveryError::Storage(_))
            ));
        }
        assert_eq!(f.store.breaker_status().state, BreakerState::Open);
        assert_eq!(
            f.store.save(SaveType::Periodic, SaveOptions::default()).unwrap(),
            SaveOutcome::Skipped(SkipReason::CircuitOpen)
        );

        f.backend.fail_next_writes(0);
        // Forced saves ignore the breaker
        assert!(f.store.perform_save(SaveType::Emergency, SaveOptions::forced()));
        assert_eq!(f.store.breaker_status().state, BreakerState::Closed);
    }

    #[test]
    fn breaker_half_opens_after_cooldown() {
        let f = fixture();
        // Each failed save spends one write on the list and one on metadata
        f.backend.fail_next_writes(6);
        for _ in 0..3 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        }
        assert_eq!(f.store.breaker_status().state, BreakerState::Open);
        assert_eq!(
            f.store.breaker_status().cooldown_remaining_ms,
            Some(10_000)
        );

        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.store.breaker_status().state, BreakerState::HalfOpen);
        assert!(f.store.perform_save(SaveType::Periodic, SaveOptions::default()));
        assert_eq!(f.store.breaker_status().consecutive_failures, 0);
    }

    #[test]
    fn restore_applies_snapshot() {
        let f = fixture();
        f.host.player.set_score(500);
        let SaveOutcome::Saved { id, .. } =
            f.store.save(SaveType::Manual, SaveOptions::default()).unwrap()
        else {
            panic!("expected save");
        };

        f.host.player.set_score(1);
        let report = f
            .store
            .restore_from_save_point(&id, RestoreOptions::default())
            .unwrap();

        assert_eq!(f.host.player.get().score, 500);
        assert_eq!(report.save_point_id.as_deref(), Some(id.as_str()));
        assert!(!report.is_partial());
        assert_eq!(f.store.statistics().total_restores, 1);
    }

    #[test]
    fn restore_unknown_id_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.store
                .restore_from_save_point("save_0_nope", RestoreOptions::default()),
            Err(RecoveryError::NotFound(_))
        ));
    }

    fn tamper_first_point(f: &Fixture) {
        let archive = Archive::new(f.backend.clone());
        let mut points = archive.load_save_points().unwrap();
        points[0]
            .snapshot
            .sections
            .insert("player".to_string(), serde_json::json!({"score": 7, "hp": 1, "level": 1}));
        archive.store_save_points(&points).unwrap();
    }

    #[test]
    fn restore_refuses_tampered_point_unless_skipping_errors() {
        let f = fixture();
        f.store.perform_save(SaveType::Manual, SaveOptions::default());
        tamper_first_point(&f);
        let store = reopen(&f);
        let id = store.list_save_points()[0].id.clone();

        assert!(matches!(
            store.restore_from_save_point(&id, RestoreOptions::default()),
            Err(RecoveryError::Validation(
                ValidationError::ChecksumMismatch { .. }
            ))
        ));
        assert_eq!(f.host.player.get().score, 0);

        store
            .restore_from_save_point(
                &id,
                RestoreOptions {
                    skip_errors: true,
                    ..RestoreOptions::default()
                },
            )
            .unwrap();
        assert_eq!(f.host.player.get().score, 7);
    }

    #[test]
    fn apply_failure_surfaces_unless_skipping_errors() {
        let f = fixture();
        f.store.perform_save(SaveType::Manual, SaveOptions::default());
        let id = f.store.list_save_points()[0].id.clone();
        f.host.player.fail_imports(true);

        assert!(matches!(
            f.store.restore_from_save_point(&id, RestoreOptions::default()),
            Err(RecoveryError::Apply(_))
        ));

        let report = f
            .store
            .restore_from_save_point(
                &id,
                RestoreOptions {
                    skip_errors: true,
                    ..RestoreOptions::default()
                },
            )
            .unwrap();
        assert!(report.is_partial());
        assert_eq!(report.apply.applied, vec!["settings"]);
    }

    #[test]
    fn backup_current_saves_before_restoring() {
        let f = fixture();
        f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        let id = f.store.list_save_points()[0].id.clone();

        f.store
            .restore_from_save_point(
                &id,
                RestoreOptions {
                    backup_current: true,
                    ..RestoreOptions::default()
                },
            )
            .unwrap();

        assert_eq!(
            types(&f.store),
            vec![(SaveType::Periodic, 0), (SaveType::Manual, 1)]
        );
    }

    #[test]
    fn restore_latest_prefers_priority_over_recency() {
        let f = fixture();
        f.host.player.set_score(10);
        f.store.perform_save(SaveType::BeforeCritical, SaveOptions::default());
        f.clock.advance(Duration::from_secs(1));
        f.host.player.set_score(20);
        f.store.perform_save(SaveType::Periodic, SaveOptions::default());

        let report = f.store.restore_latest(RestoreOptions::default()).unwrap();
        assert_eq!(report.save_type, Some(SaveType::BeforeCritical));
        assert_eq!(f.host.player.get().score, 10);
    }

    #[test]
    fn restore_latest_on_empty_store_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.store.restore_latest(RestoreOptions::default()),
            Err(RecoveryError::NotFound(_))
        ));
    }

    #[test]
    fn record_emergency_writes_save_and_slot() {
        let f = fixture();
        f.host.player.set_score(77);

        assert!(f.store.record_emergency("boom"));

        assert_eq!(types(&f.store), vec![(SaveType::Emergency, 0)]);
        let record = Archive::new(f.backend.clone())
            .load_emergency()
            .unwrap()
            .unwrap();
        assert_eq!(record.error_message, "boom");
    }

    #[test]
    fn emergency_restore_prefers_slot() {
        let f = fixture();
        f.host.player.set_score(5);
        f.store.perform_save(SaveType::Manual, SaveOptions::default());
        f.host.player.set_score(77);
        f.store.record_emergency("boom");

        f.host.player.set_score(0);
        let report = f.store.perform_emergency_restore().unwrap();

        assert!(report.emergency);
        assert_eq!(report.save_point_id, None);
        assert_eq!(f.host.player.get().score, 77);
    }

    #[test]
    fn emergency_restore_falls_back_to_latest() {
        let f = fixture();
        f.host.player.set_score(5);
        f.store.perform_save(SaveType::Manual, SaveOptions::default());
        f.backend.set(EMERGENCY_KEY, b"garbage").unwrap();

        f.host.player.set_score(0);
        let report = f.store.perform_emergency_restore().unwrap();

        assert!(report.emergency);
        assert_eq!(report.save_type, Some(SaveType::Manual));
        assert_eq!(f.host.player.get().score, 5);
    }

    #[test]
    fn validate_all_drops_tampered_points_and_repairs_index() {
        let f = fixture();
        for _ in 0..3 {
            f.store.perform_save(SaveType::Manual, SaveOptions::default());
        }
        tamper_first_point(&f);
        let store = reopen(&f);

        let summary = store.validate_all_save_points().unwrap();
        assert_eq!(
            summary,
            ValidationSummary {
                valid: 2,
                invalid: 1,
                repaired: 1
            }
        );
        assert_eq!(store.save_point_count(), 2);
        assert_eq!(store.statistics().next_save_index, 3);
    }

    #[test]
    fn reopen_recovers_index_past_evicted_points() {
        let f = fixture_with(with_max(2));
        for _ in 0..6 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        }

        let store = reopen(&f);
        assert_eq!(store.statistics().next_save_index, 6);
        assert!(store.perform_save(SaveType::Periodic, SaveOptions::default()));
        assert!(types(&store).iter().all(|(_, i)| *i >= 5));
        assert!(types(&store).iter().any(|(_, i)| *i == 6));
    }

    #[test]
    fn reopen_after_clear_keeps_index_from_metadata() {
        let f = fixture();
        for _ in 0..3 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        }
        f.store.clear_all_save_points().unwrap();

        let store = reopen(&f);
        assert_eq!(store.save_point_count(), 0);
        assert_eq!(store.statistics().next_save_index, 3);
    }

    #[test]
    fn float_state_stays_valid_after_reopen() {
        let backend: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let position = Arc::new(crate::test_utils::Cell::<f64>::default());
        let mut registry = CapabilityRegistry::new().with_session_id("floats");
        registry.register("position", position.clone());
        let registry = Arc::new(registry);

        let open = || {
            SnapshotStore::open(
                StateCapture::new(registry.clone()),
                backend.clone(),
                SnapshotSettings::default(),
                EventBus::new(),
            )
        };

        let store = open();
        for x in [116.93251052088495, 0.1 + 0.2, 1.0 / 3.0, 187.44444444444446] {
            position.update(|p| *p = x);
            assert!(store.perform_save(SaveType::Manual, SaveOptions::default()));
        }
        assert!(store.record_emergency("frame budget blown"));

        let reopened = open();
        assert!(reopened.list_save_points().iter().all(|p| p.valid));
        assert_eq!(
            reopened.validate_all_save_points().unwrap(),
            ValidationSummary {
                valid: 5,
                invalid: 0,
                repaired: 0
            }
        );

        position.update(|p| *p = 0.0);
        let first = reopened
            .list_save_points()
            .into_iter()
            .min_by_key(|p| p.save_index)
            .unwrap();
        reopened
            .restore_from_save_point(&first.id, RestoreOptions::default())
            .unwrap();
        assert_eq!(position.get(), 116.93251052088495);

        assert!(reopened.perform_emergency_restore().unwrap().emergency);
        assert_eq!(position.get(), 187.44444444444446);
    }

    /// Host whose first export reports an error back into the store
    struct ReentrantHost {
        inner: Arc<CapabilityRegistry>,
        store: std::sync::OnceLock<std::sync::Weak<SnapshotStore>>,
        reported: std::sync::atomic::AtomicBool,
    }

    impl HostApplication for ReentrantHost {
        fn export_state(&self) -> Result<crate::capture::StateSections> {
            if !self.reported.swap(true, std::sync::atomic::Ordering::SeqCst) {
                if let Some(store) = self.store.get().and_then(|w| w.upgrade()) {
                    store.record_emergency("sprite atlas missing");
                }
            }
            self.inner.export_state()
        }

        fn import_state(
            &self,
            sections: &crate::capture::StateSections,
            policy: ApplyPolicy,
        ) -> std::result::Result<crate::capture::ApplyReport, crate::error::ApplyError> {
            self.inner.import_state(sections, policy)
        }
    }

    #[test]
    fn exporter_may_report_errors_during_save() {
        let game = GameHost::new();
        let host = Arc::new(ReentrantHost {
            inner: game.registry(),
            store: std::sync::OnceLock::new(),
            reported: std::sync::atomic::AtomicBool::new(false),
        });
        let backend = Arc::new(MemoryStore::new());
        let store = Arc::new(SnapshotStore::open(
            StateCapture::new(host.clone()),
            backend.clone(),
            SnapshotSettings::default(),
            EventBus::new(),
        ));
        let _ = host.store.set(Arc::downgrade(&store));

        assert!(store.perform_save(SaveType::Manual, SaveOptions::default()));

        assert_eq!(
            types(&store),
            vec![(SaveType::Emergency, 0), (SaveType::Manual, 1)]
        );
        assert!(Archive::new(backend).load_emergency().unwrap().is_some());
    }

    #[test]
    fn delete_and_list_newest_first() {
        let f = fixture();
        for _ in 0..3 {
            f.store.perform_save(SaveType::Manual, SaveOptions::default());
        }
        let listed = f.store.list_save_points();
        assert_eq!(
            listed.iter().map(|p| p.save_index).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
        assert!(listed.iter().all(|p| p.valid));

        assert!(f.store.delete_save_point(&listed[1].id).unwrap());
        assert!(!f.store.delete_save_point(&listed[1].id).unwrap());
        assert_eq!(
            types(&f.store),
            vec![(SaveType::Manual, 0), (SaveType::Manual, 2)]
        );
    }

    #[test]
    fn lowering_max_trims_immediately() {
        let f = fixture();
        f.store.perform_save(SaveType::Emergency, SaveOptions::default());
        for _ in 0..4 {
            f.store.perform_save(SaveType::Periodic, SaveOptions::default());
        }

        f.store.update_settings(with_max(2));

        assert_eq!(
            types(&f.store),
            vec![(SaveType::Emergency, 0), (SaveType::Periodic, 4)]
        );
        assert_eq!(
            Archive::new(f.backend.clone())
                .load_save_points()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn storage_usage_counts_archive_keys() {
        let f = fixture();
        f.store.perform_save(SaveType::Manual, SaveOptions::default());
        let usage = f.store.storage_usage().unwrap();
        assert!(usage.save_points_bytes > 0);
        assert_eq!(usage.budget_bytes, 5 * 1024 * 1024);
    }
}
