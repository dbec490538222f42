//! Wiring between host lifecycle events and the recovery components
//!
//! The orchestrator owns the periodic autosave timer and the lifecycle
//! listener task. Both are explicit handles: `stop()` and `destroy()` tear
//! them down, nothing is left running behind a global registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::capture::{HostApplication, StateCapture};
use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::events::{EventBus, RecoveryEvent};
use crate::guard::{
    ActionDispatcher, ClickDecision, ClickEvent, GuardStatistics, LiveMetrics, PreventionGuard,
    StateWarning, UiSurface,
};
use crate::history::{
    Action, ActionHistory, HistoryOutcome, HistoryStatistics, KeyChord, RecordOutcome,
};
use crate::schedule::{spawn_delayed, DelayedTask};
use crate::snapshot_store::{SaveOptions, SaveStatistics, SaveType, SnapshotStore};
use crate::store::PersistentStore;

/// Errors inside this window count toward the burst threshold
const ERROR_WINDOW: Duration = Duration::from_secs(60);
const ERROR_BURST_THRESHOLD: usize = 3;
const ERROR_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutosaveSettings {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub focus_save_delay: Duration,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(30_000),
            focus_save_delay: Duration::from_millis(1_000),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Lifecycle and input events the host reports
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Start,
    End,
    Error { kind: String, message: String },
    CriticalAction(Action),
    BeforeUnload,
    FocusLost,
    FocusGained,
    Action(Action),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_kind: BTreeMap<String, u64>,
    /// Errors within the last minute
    pub recent_errors: usize,
    pub last_error: Option<ErrorEntry>,
}

#[derive(Default)]
struct ErrorMonitor {
    log: VecDeque<(Instant, ErrorEntry)>,
    by_kind: BTreeMap<String, u64>,
    total: u64,
}

impl ErrorMonitor {
    /// Log an error and return how many fall inside the window
    fn record(&mut self, entry: ErrorEntry, now: Instant) -> usize {
        *self.by_kind.entry(entry.kind.clone()).or_default() += 1;
        self.total += 1;
        self.log.push_back((now, entry));
        while self.log.len() > ERROR_LOG_LIMIT {
            self.log.pop_front();
        }
        self.recent(now)
    }

    fn recent(&self, now: Instant) -> usize {
        self.log
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= ERROR_WINDOW)
            .count()
    }

    fn statistics(&self, now: Instant) -> ErrorStatistics {
        ErrorStatistics {
            total_errors: self.total,
            by_kind: self.by_kind.clone(),
            recent_errors: self.recent(now),
            last_error: self.log.back().map(|(_, e)| e.clone()),
        }
    }
}

struct AutosaveTimer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl AutosaveTimer {
    fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    /// Periodic timer currently scheduled
    pub periodic_active: bool,
    pub autosave: AutosaveSettings,
    pub saves: SaveStatistics,
    pub history: HistoryStatistics,
    pub guard: GuardStatistics,
    pub errors: ErrorStatistics,
}

pub struct RecoveryOrchestrator {
    snapshots: Arc<SnapshotStore>,
    history: ActionHistory,
    guard: PreventionGuard,
    events: EventBus,
    clock: Arc<dyn Clock>,
    autosave: Mutex<AutosaveSettings>,
    /// Set between `start()` and `stop()`/`destroy()`, whatever the timer
    started: AtomicBool,
    timer: Mutex<Option<AutosaveTimer>>,
    focus_save: Mutex<Option<DelayedTask>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    errors: Mutex<ErrorMonitor>,
}

impl RecoveryOrchestrator {
    pub fn new(
        host: Arc<dyn HostApplication>,
        backend: Arc<dyn PersistentStore>,
        ui: Arc<dyn UiSurface>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: &RecoveryConfig,
    ) -> Self {
        Self::with_clock(host, backend, ui, dispatcher, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        host: Arc<dyn HostApplication>,
        backend: Arc<dyn PersistentStore>,
        ui: Arc<dyn UiSurface>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: &RecoveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBus::new();
        let capture = StateCapture::with_clock(host, clock.clone());

        let snapshots = Arc::new(SnapshotStore::open(
            capture.clone(),
            backend,
            config.snapshot_settings(),
            events.clone(),
        ));
        let history = ActionHistory::new(capture, config.history_config(), events.clone());
        history.set_enabled(config.history.enabled);
        let guard = PreventionGuard::with_clock(
            config.guard_config(),
            ui,
            dispatcher,
            events.clone(),
            clock.clone(),
        );

        let autosave = config.autosave_settings();
        snapshots.set_enabled(autosave.enabled);

        Self {
            snapshots,
            history,
            guard,
            events,
            clock,
            autosave: Mutex::new(autosave),
            started: AtomicBool::new(false),
            timer: Mutex::new(None),
            focus_save: Mutex::new(None),
            listener: Mutex::new(None),
            errors: Mutex::new(ErrorMonitor::default()),
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn guard(&self) -> &PreventionGuard {
        &self.guard
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Whether `start()` has run without a matching `stop()` or `destroy()`
    ///
    /// Stays true while periodic autosave is disabled.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn timer_active(&self) -> bool {
        lock(&self.timer).is_some()
    }

    /// Write the initial save and start periodic autosave
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("orchestrator already running");
            return;
        }
        self.snapshots
            .perform_save(SaveType::Initial, SaveOptions::default());

        let settings = lock(&self.autosave).clone();
        if settings.enabled {
            self.start_timer(settings.interval);
        }
        tracing::info!(
            interval_ms = settings.interval.as_millis() as u64,
            autosave = settings.enabled,
            "recovery started"
        );
    }

    /// Stop periodic autosave and write a final save
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.halt_timers();
        self.snapshots
            .perform_save(SaveType::Final, SaveOptions::forced());
        tracing::info!("recovery stopped");
    }

    /// Tear everything down, leaving one last `destroy` save behind
    pub fn destroy(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.halt_timers();
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.guard.destroy();
        self.snapshots
            .perform_save(SaveType::Destroy, SaveOptions::forced());
        tracing::info!("recovery destroyed");
    }

    fn halt_timers(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.stop();
        }
        if let Some(task) = lock(&self.focus_save).take() {
            task.cancel();
        }
    }

    fn start_timer(&self, interval: Duration) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("no tokio runtime, periodic autosave not started");
                self.events
                    .diagnostic("orchestrator", "periodic autosave needs a tokio runtime");
                return;
            }
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let snapshots = Arc::clone(&self.snapshots);
        let handle = runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        snapshots.perform_save(SaveType::Periodic, SaveOptions::default());
                    }
                }
            }
            tracing::debug!("autosave timer exited");
        });

        let previous = lock(&self.timer).replace(AutosaveTimer {
            shutdown_tx: Some(shutdown_tx),
            handle,
        });
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Apply new autosave settings, restarting the timer while started
    pub fn update_autosave(&self, settings: AutosaveSettings) {
        let running = self.is_running();
        *lock(&self.autosave) = settings.clone();
        self.snapshots.set_enabled(settings.enabled);

        if running {
            if let Some(timer) = lock(&self.timer).take() {
                timer.stop();
            }
            if settings.enabled {
                self.start_timer(settings.interval);
            }
        }
    }

    pub fn autosave_settings(&self) -> AutosaveSettings {
        lock(&self.autosave).clone()
    }

    /// Route one lifecycle event
    pub fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Start => {
                self.snapshots
                    .perform_save(SaveType::GameStart, SaveOptions::default());
            }
            LifecycleEvent::End => {
                self.snapshots
                    .perform_save(SaveType::GameEnd, SaveOptions::default());
            }
            LifecycleEvent::Error { kind, message } => self.report_error(&kind, &message),
            LifecycleEvent::CriticalAction(action) => {
                if let Err(e) = self.record_critical_action(action) {
                    tracing::warn!(error = %e, "critical action not recorded");
                }
            }
            LifecycleEvent::BeforeUnload => {
                self.snapshots
                    .perform_save(SaveType::BeforeUnload, SaveOptions::forced());
            }
            LifecycleEvent::FocusLost => {
                self.snapshots
                    .perform_save(SaveType::WindowBlur, SaveOptions::default());
            }
            LifecycleEvent::FocusGained => self.schedule_focus_save(),
            LifecycleEvent::Action(action) => {
                if let Err(e) = self.record_action(action) {
                    tracing::debug!(error = %e, "action not recorded");
                }
            }
        }
    }

    /// Record an ordinary action in the history
    pub fn record_action(&self, action: Action) -> Result<RecordOutcome> {
        self.history.record(action)
    }

    /// Save before a critical action, then record it
    pub fn record_critical_action(&self, action: Action) -> Result<RecordOutcome> {
        self.snapshots
            .perform_save(SaveType::BeforeCritical, SaveOptions::default());
        self.history.record(action)
    }

    /// Write the emergency slot and track error frequency
    pub fn report_error(&self, kind: &str, message: &str) {
        tracing::error!(kind, message, "host reported error");
        self.snapshots.record_emergency(message);

        let entry = ErrorEntry {
            kind: kind.to_string(),
            message: message.to_string(),
            recorded_at: self.clock.now_datetime(),
        };
        let recent = lock(&self.errors).record(entry, self.clock.now());
        if recent >= ERROR_BURST_THRESHOLD {
            tracing::warn!(recent_errors = recent, "high error rate");
            self.events.emit(RecoveryEvent::HighErrorRate {
                recent_errors: recent,
                window_ms: ERROR_WINDOW.as_millis() as u64,
            });
        }
    }

    fn schedule_focus_save(&self) {
        let delay = lock(&self.autosave).focus_save_delay;
        let snapshots: Weak<SnapshotStore> = Arc::downgrade(&self.snapshots);
        let task = spawn_delayed(delay, move || {
            if let Some(snapshots) = snapshots.upgrade() {
                snapshots.perform_save(SaveType::WindowFocus, SaveOptions::default());
            }
        });
        if let Some(previous) = lock(&self.focus_save).replace(task) {
            previous.cancel();
        }
    }

    /// Feed lifecycle events through a channel instead of direct calls
    ///
    /// Returns None outside a tokio runtime. The listener ends when every
    /// sender is dropped or on `destroy()`.
    pub fn attach_lifecycle(self: &Arc<Self>) -> Option<mpsc::UnboundedSender<LifecycleEvent>> {
        let runtime = Handle::try_current().ok()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.handle_event(event);
            }
            tracing::debug!("lifecycle listener exited");
        });
        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        Some(tx)
    }

    pub fn handle_click(&self, event: &ClickEvent) -> ClickDecision {
        self.guard.handle_click(event)
    }

    pub fn handle_shortcut(&self, chord: &KeyChord) -> Option<Result<HistoryOutcome>> {
        self.history.handle_shortcut(chord)
    }

    pub fn check_state_warnings(&self, metrics: &LiveMetrics) -> Vec<StateWarning> {
        self.guard.check_state_warnings(metrics)
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        lock(&self.errors).statistics(self.clock.now())
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.is_running(),
            periodic_active: self.timer_active(),
            autosave: self.autosave_settings(),
            saves: self.snapshots.statistics(),
            history: self.history.statistics(),
            guard: self.guard.statistics(),
            errors: self.error_statistics(),
        }
    }
}

impl Drop for RecoveryOrchestrator {
    fn drop(&mut self) {
        self.halt_timers();
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
