//! Input guard: click classification and critical-action confirmation
//!
//! Every click passes through [`PreventionGuard::handle_click`]:
//! 1. Classify against the target's recent clicks (double, rapid, spam)
//! 2. Block anything that is not a normal click
//! 3. If the target carries a critical marker, block it and open a
//!    confirmation instead
//!
//! A confirmed action is re-dispatched after a safety delay that depends on
//! how destructive it is. The delay runs even if the UI is already hidden,
//! and the confirmation stays pending (so further clicks stay blocked)
//! until the dispatch has happened.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, RecoveryEvent};
use crate::schedule::{spawn_delayed, DelayedTask};

/// Whitespace, hyphens and underscores are ignored when matching text
static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-_]+").expect("separator pattern is valid"));

fn normalize(text: &str) -> String {
    SEPARATORS.replace_all(&text.to_lowercase(), "").into_owned()
}

/// What the guard can see of a click target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    pub id: String,
    pub classes: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

impl TargetDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A click plus whatever the host needs to replay it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickEvent {
    pub target: TargetDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ClickEvent {
    pub fn on(target: TargetDescriptor) -> Self {
        Self {
            target,
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickKind {
    Normal,
    Double,
    Rapid,
    Spam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickDecision {
    Allow,
    Blocked(ClickKind),
    /// Blocked; a confirmation was opened for the target
    ConfirmationRequested,
    /// Blocked; the target already has a confirmation open
    ConfirmationPending,
}

impl ClickDecision {
    pub fn allows(self) -> bool {
        self == ClickDecision::Allow
    }
}

/// Which destructive action a critical target performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalKind {
    Reset,
    Delete,
    Clear,
    NewGame,
    Quit,
    Logout,
    Other,
}

impl CriticalKind {
    fn from_normalized(text: &str) -> Option<Self> {
        const KEYWORDS: [(&str, CriticalKind); 7] = [
            ("newgame", CriticalKind::NewGame),
            ("restart", CriticalKind::Reset),
            ("reset", CriticalKind::Reset),
            ("delete", CriticalKind::Delete),
            ("clear", CriticalKind::Clear),
            ("logout", CriticalKind::Logout),
            ("quit", CriticalKind::Quit),
        ];
        KEYWORDS
            .iter()
            .find(|(word, _)| text.contains(word))
            .map(|(_, kind)| *kind)
    }

    pub fn label(self) -> &'static str {
        match self {
            CriticalKind::Reset => "Reset",
            CriticalKind::Delete => "Delete",
            CriticalKind::Clear => "Clear",
            CriticalKind::NewGame => "New Game",
            CriticalKind::Quit => "Quit",
            CriticalKind::Logout => "Log Out",
            CriticalKind::Other => "Action",
        }
    }

    pub fn warning_text(self) -> &'static str {
        match self {
            CriticalKind::Reset => "This will reset the current game. All progress will be lost.",
            CriticalKind::Delete => "This will permanently delete the selected data.",
            CriticalKind::Clear => "This will clear all data. This cannot be undone.",
            CriticalKind::NewGame => {
                "Starting a new game ends the current one. Unsaved progress will be lost."
            }
            CriticalKind::Quit => "Quit now? Unsaved progress will be lost.",
            CriticalKind::Logout => "Log out now? Unsaved progress will be lost.",
            CriticalKind::Other => "This action cannot be undone. Continue?",
        }
    }

    pub fn priority(self) -> ConfirmationPriority {
        match self {
            CriticalKind::Reset | CriticalKind::Delete => ConfirmationPriority::Critical,
            CriticalKind::Clear | CriticalKind::NewGame => ConfirmationPriority::High,
            _ => ConfirmationPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationPriority {
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationRequest {
    pub element_id: String,
    pub title: String,
    pub warning_text: String,
    pub priority: ConfirmationPriority,
    pub kind: CriticalKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Confirmed,
    Cancelled,
    TimedOut,
}

/// Dialog surface provided by the host
pub trait UiSurface: Send + Sync {
    /// Show a confirmation; the user's answer goes through `responder`
    fn show_confirmation(&self, request: &ConfirmationRequest, responder: ConfirmationResponder);

    fn hide(&self, element_id: &str);
}

/// Replays a confirmed click into the host
pub trait ActionDispatcher: Send + Sync {
    fn dispatch(&self, event: &ClickEvent);
}

/// Answer handle handed to the UI with each confirmation
///
/// Tied to one request: answering a request that was already resolved or
/// replaced is a no-op returning false. Holds the guard weakly.
#[derive(Clone)]
pub struct ConfirmationResponder {
    guard: Weak<Inner>,
    element_id: String,
    seq: u64,
}

impl ConfirmationResponder {
    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn confirm(&self) -> bool {
        match self.guard.upgrade() {
            Some(inner) => inner.confirm(&self.element_id, self.seq),
            None => false,
        }
    }

    pub fn cancel(&self) -> bool {
        match self.guard.upgrade() {
            Some(inner) => inner.resolve(&self.element_id, self.seq, ConfirmationOutcome::Cancelled),
            None => false,
        }
    }
}

impl std::fmt::Debug for ConfirmationResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationResponder")
            .field("element_id", &self.element_id)
            .field("seq", &self.seq)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyDelays {
    pub game_reset: Duration,
    pub destructive: Duration,
    pub critical: Duration,
    pub settings: Duration,
}

impl Default for SafetyDelays {
    fn default() -> Self {
        Self {
            game_reset: Duration::from_millis(1000),
            destructive: Duration::from_millis(500),
            critical: Duration::from_millis(200),
            settings: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarningThresholds {
    pub low_hp: f64,
    pub low_score: i64,
    pub time_running_out: Duration,
    pub high_error_rate: f64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            low_hp: 20.0,
            low_score: 100,
            time_running_out: Duration::from_millis(10_000),
            high_error_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    pub enabled: bool,
    pub prevent_double_clicks: bool,
    pub prevent_rapid_clicks: bool,
    pub confirm_critical_actions: bool,
    pub double_click_threshold: Duration,
    /// Clicks per frequency window counted as rapid
    pub rapid_click_threshold: usize,
    /// Clicks per frequency window counted as spam
    pub spam_click_threshold: usize,
    pub frequency_window: Duration,
    /// Timestamps kept per target
    pub click_history_len: usize,
    pub confirmation_timeout: Duration,
    pub safety_delays: SafetyDelays,
    pub warnings: WarningThresholds,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prevent_double_clicks: true,
            prevent_rapid_clicks: true,
            confirm_critical_actions: true,
            double_click_threshold: Duration::from_millis(300),
            rapid_click_threshold: 5,
            spam_click_threshold: 10,
            frequency_window: Duration::from_secs(1),
            click_history_len: 10,
            confirmation_timeout: Duration::from_millis(30_000),
            safety_delays: SafetyDelays::default(),
            warnings: WarningThresholds::default(),
        }
    }
}

/// Markers that make a target critical
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalMarkers {
    pub classes: Vec<String>,
    pub attributes: Vec<String>,
    /// Matched against the target text ignoring case and separators
    pub text_patterns: Vec<String>,
}

impl Default for CriticalMarkers {
    fn default() -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            classes: owned(&[
                "reset-btn",
                "delete-btn",
                "clear-btn",
                "new-game-btn",
                "quit-btn",
                "logout-btn",
            ]),
            attributes: owned(&["data-confirm-action", "data-destructive", "data-critical"]),
            text_patterns: owned(&["reset", "delete", "clear", "newgame", "quit", "logout", "restart"]),
        }
    }
}

impl CriticalMarkers {
    /// Kind of critical action `target` performs, or None if it is not critical
    pub fn classify(&self, target: &TargetDescriptor) -> Option<CriticalKind> {
        let by_class = target.classes.iter().find(|c| self.classes.contains(c));
        let by_attribute = self
            .attributes
            .iter()
            .find(|a| target.attributes.contains_key(a.as_str()));
        let text = normalize(&target.text);
        let by_text = !text.is_empty()
            && self
                .text_patterns
                .iter()
                .any(|p| text.contains(&normalize(p)));

        if by_class.is_none() && by_attribute.is_none() && !by_text {
            return None;
        }

        let hint = target
            .attribute("data-confirm-action")
            .map(normalize)
            .into_iter()
            .chain(by_class.map(|c| normalize(c)))
            .chain(std::iter::once(text));
        Some(
            hint.filter_map(|h| CriticalKind::from_normalized(&h))
                .next()
                .unwrap_or(CriticalKind::Other),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    LowHp,
    LowScore,
    TimeRunningOut,
    HighErrorRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateWarning {
    pub kind: WarningKind,
    pub severity: WarningSeverity,
    pub message: String,
}

/// Live metrics the host reports for advisory warnings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveMetrics {
    pub hp: Option<f64>,
    pub score: Option<i64>,
    pub time_remaining: Option<Duration>,
    /// Fraction of recent operations that failed, 0.0..=1.0
    pub error_rate: Option<f64>,
}

/// Compare live metrics against thresholds; never blocks anything
pub fn evaluate_warnings(metrics: &LiveMetrics, thresholds: &WarningThresholds) -> Vec<StateWarning> {
    let mut warnings = Vec::new();

    if let Some(hp) = metrics.hp {
        if hp <= thresholds.low_hp {
            let severity = if hp <= thresholds.low_hp / 2.0 {
                WarningSeverity::Critical
            } else {
                WarningSeverity::High
            };
            warnings.push(StateWarning {
                kind: WarningKind::LowHp,
                severity,
                message: format!("HP is low ({})", hp),
            });
        }
    }

    if let Some(score) = metrics.score {
        if score <= thresholds.low_score {
            warnings.push(StateWarning {
                kind: WarningKind::LowScore,
                severity: WarningSeverity::Medium,
                message: format!("Score is low ({})", score),
            });
        }
    }

    if let Some(remaining) = metrics.time_remaining {
        if remaining <= thresholds.time_running_out {
            let severity = if remaining <= Duration::from_millis(5_000) {
                WarningSeverity::Critical
            } else {
                WarningSeverity::High
            };
            warnings.push(StateWarning {
                kind: WarningKind::TimeRunningOut,
                severity,
                message: format!("{}s remaining", remaining.as_secs()),
            });
        }
    }

    if let Some(rate) = metrics.error_rate {
        if rate >= thresholds.high_error_rate {
            let severity = if rate >= 0.5 {
                WarningSeverity::High
            } else {
                WarningSeverity::Medium
            };
            warnings.push(StateWarning {
                kind: WarningKind::HighErrorRate,
                severity,
                message: format!("Error rate is {:.0}%", rate * 100.0),
            });
        }
    }

    warnings
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardStatistics {
    pub prevented_double_clicks: u64,
    /// Rapid and spam clicks together
    pub prevented_rapid_clicks: u64,
    pub pending_confirmations: usize,
    pub warnings_generated: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub average_confirmation_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    prevented_double_clicks: u64,
    prevented_rapid_clicks: u64,
    warnings_generated: u64,
    confirmed: u64,
    cancelled: u64,
    timed_out: u64,
    confirmation_time_total: Duration,
}

struct PendingConfirmation {
    seq: u64,
    event: ClickEvent,
    kind: CriticalKind,
    opened_at: Instant,
    /// Set once the user confirms; the entry stays until dispatch
    confirmed: bool,
    timeout: Option<DelayedTask>,
    dispatch: Option<DelayedTask>,
}

impl PendingConfirmation {
    fn cancel_timers(&self) {
        if let Some(task) = &self.timeout {
            task.cancel();
        }
        if let Some(task) = &self.dispatch {
            task.cancel();
        }
    }
}

struct GuardState {
    config: GuardConfig,
    markers: CriticalMarkers,
    clicks: HashMap<String, VecDeque<Instant>>,
    pending: HashMap<String, PendingConfirmation>,
    next_seq: u64,
    counters: Counters,
}

impl GuardState {
    /// Classify a click and add it to the target's history
    fn classify_click(&mut self, target_id: &str, now: Instant) -> ClickKind {
        let config = &self.config;
        let history = self.clicks.entry(target_id.to_string()).or_default();

        let since_last = history.back().map(|last| now.saturating_duration_since(*last));

        history.push_back(now);
        while history.len() > config.click_history_len.max(1) {
            history.pop_front();
        }
        let in_window = history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= config.frequency_window)
            .count();

        if in_window >= config.spam_click_threshold {
            ClickKind::Spam
        } else if in_window >= config.rapid_click_threshold {
            ClickKind::Rapid
        } else if since_last.is_some_and(|d| d < config.double_click_threshold) {
            ClickKind::Double
        } else {
            ClickKind::Normal
        }
    }

    fn blocks(&self, kind: ClickKind) -> bool {
        match kind {
            ClickKind::Normal => false,
            ClickKind::Double => self.config.prevent_double_clicks,
            ClickKind::Rapid | ClickKind::Spam => self.config.prevent_rapid_clicks,
        }
    }

    fn safety_delay(&self, kind: CriticalKind, target: &TargetDescriptor) -> Duration {
        let delays = &self.config.safety_delays;
        match kind {
            CriticalKind::Reset => delays.game_reset,
            CriticalKind::Delete => delays.destructive,
            _ if target.attributes.contains_key("data-settings") => delays.settings,
            _ => delays.critical,
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    ui: Arc<dyn UiSurface>,
    dispatcher: Arc<dyn ActionDispatcher>,
    events: EventBus,
    state: Mutex<GuardState>,
}

#[derive(Clone)]
pub struct PreventionGuard {
    inner: Arc<Inner>,
}

impl PreventionGuard {
    pub fn new(
        config: GuardConfig,
        ui: Arc<dyn UiSurface>,
        dispatcher: Arc<dyn ActionDispatcher>,
        events: EventBus,
    ) -> Self {
        Self::with_clock(config, ui, dispatcher, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GuardConfig,
        ui: Arc<dyn UiSurface>,
        dispatcher: Arc<dyn ActionDispatcher>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                ui,
                dispatcher,
                events,
                state: Mutex::new(GuardState {
                    config,
                    markers: CriticalMarkers::default(),
                    clicks: HashMap::new(),
                    pending: HashMap::new(),
                    next_seq: 1,
                    counters: Counters::default(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.inner.lock()
    }

    /// Decide whether a click reaches the host
    pub fn handle_click(&self, event: &ClickEvent) -> ClickDecision {
        let element_id = event.target.id.clone();
        let now = self.inner.clock.now();

        let mut state = self.lock();
        if !state.config.enabled {
            return ClickDecision::Allow;
        }

        let kind = state.classify_click(&element_id, now);
        if state.blocks(kind) {
            match kind {
                ClickKind::Double => state.counters.prevented_double_clicks += 1,
                _ => state.counters.prevented_rapid_clicks += 1,
            }
            drop(state);
            tracing::debug!(%element_id, ?kind, "click prevented");
            self.inner
                .events
                .emit(RecoveryEvent::ClickPrevented { element_id, kind });
            return ClickDecision::Blocked(kind);
        }

        if !state.config.confirm_critical_actions {
            return ClickDecision::Allow;
        }
        let Some(critical) = state.markers.classify(&event.target) else {
            return ClickDecision::Allow;
        };
        if state.pending.contains_key(&element_id) {
            tracing::debug!(%element_id, "confirmation already pending");
            return ClickDecision::ConfirmationPending;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let request = ConfirmationRequest {
            element_id: element_id.clone(),
            title: format!("Confirm {}", critical.label()),
            warning_text: event
                .target
                .attribute("data-warning")
                .map(str::to_string)
                .unwrap_or_else(|| critical.warning_text().to_string()),
            priority: critical.priority(),
            kind: critical,
            created_at: self.inner.clock.now_datetime(),
        };

        let weak = Arc::downgrade(&self.inner);
        let timeout_id = element_id.clone();
        let timeout = spawn_delayed(state.config.confirmation_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.resolve(&timeout_id, seq, ConfirmationOutcome::TimedOut);
            }
        });

        state.pending.insert(
            element_id.clone(),
            PendingConfirmation {
                seq,
                event: event.clone(),
                kind: critical,
                opened_at: now,
                confirmed: false,
                timeout: Some(timeout),
                dispatch: None,
            },
        );
        drop(state);

        tracing::info!(%element_id, kind = ?critical, "confirmation requested");
        self.inner.events.emit(RecoveryEvent::ConfirmationRequested {
            element_id: element_id.clone(),
            title: request.title.clone(),
        });
        self.inner.ui.show_confirmation(
            &request,
            ConfirmationResponder {
                guard: Arc::downgrade(&self.inner),
                element_id,
                seq,
            },
        );

        ClickDecision::ConfirmationRequested
    }

    /// Confirm whatever request is open for `element_id`
    pub fn confirm(&self, element_id: &str) -> bool {
        let seq = self.lock().pending.get(element_id).map(|p| p.seq);
        seq.is_some_and(|seq| self.inner.confirm(element_id, seq))
    }

    /// Cancel whatever request is open for `element_id`
    pub fn cancel(&self, element_id: &str) -> bool {
        let seq = self.lock().pending.get(element_id).map(|p| p.seq);
        seq.is_some_and(|seq| {
            self.inner
                .resolve(element_id, seq, ConfirmationOutcome::Cancelled)
        })
    }

    /// Drop every open confirmation without dispatching
    pub fn cancel_all_confirmations(&self) -> usize {
        let drained: Vec<(String, PendingConfirmation)> = self.lock().pending.drain().collect();
        for (element_id, pending) in &drained {
            pending.cancel_timers();
            self.inner.ui.hide(element_id);
            if !pending.confirmed {
                self.inner.events.emit(RecoveryEvent::ConfirmationResolved {
                    element_id: element_id.clone(),
                    outcome: ConfirmationOutcome::Cancelled,
                });
            }
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "cancelled open confirmations");
        }
        drained.len()
    }

    pub fn has_pending_confirmation(&self, element_id: &str) -> bool {
        self.lock().pending.contains_key(element_id)
    }

    pub fn pending_confirmations(&self) -> usize {
        self.lock().pending.len()
    }

    /// Advisory warnings for the given metrics
    pub fn check_state_warnings(&self, metrics: &LiveMetrics) -> Vec<StateWarning> {
        let mut state = self.lock();
        let warnings = evaluate_warnings(metrics, &state.config.warnings);
        state.counters.warnings_generated += warnings.len() as u64;
        warnings
    }

    pub fn config(&self) -> GuardConfig {
        self.lock().config.clone()
    }

    pub fn update_config(&self, config: GuardConfig) {
        let mut state = self.lock();
        let history_len = config.click_history_len.max(1);
        for history in state.clicks.values_mut() {
            while history.len() > history_len {
                history.pop_front();
            }
        }
        state.config = config;
    }

    pub fn update_critical_markers(&self, markers: CriticalMarkers) {
        self.lock().markers = markers;
    }

    pub fn statistics(&self) -> GuardStatistics {
        let state = self.lock();
        let c = &state.counters;
        let average_confirmation_ms = if c.confirmed == 0 {
            0
        } else {
            (c.confirmation_time_total / c.confirmed as u32).as_millis() as u64
        };
        GuardStatistics {
            prevented_double_clicks: c.prevented_double_clicks,
            prevented_rapid_clicks: c.prevented_rapid_clicks,
            pending_confirmations: state.pending.len(),
            warnings_generated: c.warnings_generated,
            confirmed: c.confirmed,
            cancelled: c.cancelled,
            timed_out: c.timed_out,
            average_confirmation_ms,
        }
    }

    pub fn reset_statistics(&self) {
        self.lock().counters = Counters::default();
    }

    pub fn clear_click_histories(&self) {
        self.lock().clicks.clear();
    }

    /// Cancel open confirmations, forget click history and stop guarding
    pub fn destroy(&self) {
        self.cancel_all_confirmations();
        let mut state = self.lock();
        state.clicks.clear();
        state.config.enabled = false;
        tracing::debug!("prevention guard destroyed");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn confirm(self: &Arc<Self>, element_id: &str, seq: u64) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        let delay = match state.pending.get(element_id) {
            Some(p) if p.seq == seq && !p.confirmed => state.safety_delay(p.kind, &p.event.target),
            _ => return false,
        };

        let weak = Arc::downgrade(self);
        let dispatch_id = element_id.to_string();
        let dispatch = spawn_delayed(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_confirmed(&dispatch_id, seq);
            }
        });

        let opened_at = {
            let Some(pending) = state.pending.get_mut(element_id) else {
                return false;
            };
            pending.confirmed = true;
            if let Some(task) = pending.timeout.take() {
                task.cancel();
            }
            pending.dispatch = Some(dispatch);
            pending.opened_at
        };
        state.counters.confirmed += 1;
        state.counters.confirmation_time_total += now.saturating_duration_since(opened_at);
        drop(state);

        tracing::info!(
            element_id,
            safety_delay_ms = delay.as_millis() as u64,
            "confirmation accepted"
        );
        self.ui.hide(element_id);
        self.events.emit(RecoveryEvent::ConfirmationResolved {
            element_id: element_id.to_string(),
            outcome: ConfirmationOutcome::Confirmed,
        });
        true
    }

    /// Cancel or time out an unconfirmed request
    fn resolve(&self, element_id: &str, seq: u64, outcome: ConfirmationOutcome) -> bool {
        let mut state = self.lock();
        match state.pending.get(element_id) {
            Some(p) if p.seq == seq && !p.confirmed => {}
            _ => return false,
        }
        if let Some(pending) = state.pending.remove(element_id) {
            pending.cancel_timers();
        }
        match outcome {
            ConfirmationOutcome::TimedOut => state.counters.timed_out += 1,
            _ => state.counters.cancelled += 1,
        }
        drop(state);

        tracing::info!(element_id, ?outcome, "confirmation dismissed");
        self.ui.hide(element_id);
        self.events.emit(RecoveryEvent::ConfirmationResolved {
            element_id: element_id.to_string(),
            outcome,
        });
        true
    }

    fn dispatch_confirmed(&self, element_id: &str, seq: u64) {
        let event = {
            let mut state = self.lock();
            match state.pending.get(element_id) {
                Some(p) if p.seq == seq && p.confirmed => {}
                _ => return,
            }
            match state.pending.remove(element_id) {
                Some(pending) => pending.event,
                None => return,
            }
        };

        tracing::debug!(element_id, "dispatching confirmed action");
        self.dispatcher.dispatch(&event);
        self.events.emit(RecoveryEvent::ConfirmedActionDispatched {
            element_id: element_id.to_string(),
        });
    }
}
