//! Configuration file and environment handling
//!
//! Config lives in `~/.safekeep/config.toml` unless `SAFEKEEP_CONFIG` points
//! elsewhere. `SAFEKEEP_DIR` overrides the storage directory. Every field has
//! a default, so an empty or partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::ValidationLimits;
use crate::guard::{GuardConfig, SafetyDelays, WarningThresholds};
use crate::history::HistoryConfig;
use crate::logging::LogConfig;
use crate::orchestrator::AutosaveSettings;
use crate::snapshot_store::{BreakerConfig, SnapshotSettings};

pub const DIR_ENV: &str = "SAFEKEEP_DIR";
pub const CONFIG_ENV: &str = "SAFEKEEP_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveSection {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_save_points: usize,
    pub focus_save_delay_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub max_state_bytes: u64,
    pub min_state_bytes: u64,
}

impl Default for AutosaveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            max_save_points: 5,
            focus_save_delay_ms: 1_000,
            breaker_threshold: 3,
            breaker_cooldown_ms: 10_000,
            max_state_bytes: 50 * 1024 * 1024,
            min_state_bytes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub enabled: bool,
    pub max_history: usize,
    pub after_capture_delay_ms: u64,
    pub ignored_actions: Vec<String>,
    pub critical_actions: Vec<String>,
}

impl Default for HistorySection {
    fn default() -> Self {
        let defaults = HistoryConfig::default();
        Self {
            enabled: true,
            max_history: defaults.max_history,
            after_capture_delay_ms: defaults.after_capture_delay.as_millis() as u64,
            ignored_actions: defaults.ignored_actions.into_iter().collect(),
            critical_actions: defaults.critical_actions.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub enabled: bool,
    pub prevent_double_clicks: bool,
    pub prevent_rapid_clicks: bool,
    pub confirm_critical_actions: bool,
    pub double_click_threshold_ms: u64,
    pub rapid_click_threshold: usize,
    pub spam_click_threshold: usize,
    pub click_history_len: usize,
    pub confirmation_timeout_ms: u64,
    pub safety_delay_game_reset_ms: u64,
    pub safety_delay_destructive_ms: u64,
    pub safety_delay_critical_ms: u64,
    pub safety_delay_settings_ms: u64,
    pub low_hp: f64,
    pub low_score: i64,
    pub time_running_out_ms: u64,
    pub high_error_rate: f64,
}

impl Default for GuardSection {
    fn default() -> Self {
        let guard = GuardConfig::default();
        Self {
            enabled: guard.enabled,
            prevent_double_clicks: guard.prevent_double_clicks,
            prevent_rapid_clicks: guard.prevent_rapid_clicks,
            confirm_critical_actions: guard.confirm_critical_actions,
            double_click_threshold_ms: guard.double_click_threshold.as_millis() as u64,
            rapid_click_threshold: guard.rapid_click_threshold,
            spam_click_threshold: guard.spam_click_threshold,
            click_history_len: guard.click_history_len,
            confirmation_timeout_ms: guard.confirmation_timeout.as_millis() as u64,
            safety_delay_game_reset_ms: guard.safety_delays.game_reset.as_millis() as u64,
            safety_delay_destructive_ms: guard.safety_delays.destructive.as_millis() as u64,
            safety_delay_critical_ms: guard.safety_delays.critical.as_millis() as u64,
            safety_delay_settings_ms: guard.safety_delays.settings.as_millis() as u64,
            low_hp: guard.warnings.low_hp,
            low_score: guard.warnings.low_score,
            time_running_out_ms: guard.warnings.time_running_out.as_millis() as u64,
            high_error_rate: guard.warnings.high_error_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory for the file-backed store; None means the default
    pub dir: Option<PathBuf>,
    /// Hard cap enforced by the file store; None means unbounded
    pub capacity_bytes: Option<u64>,
    /// Budget used for usage percentages
    pub budget_bytes: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            dir: None,
            capacity_bytes: None,
            budget_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub autosave: AutosaveSection,
    pub history: HistorySection,
    pub guard: GuardSection,
    pub storage: StorageSection,
    pub logging: LogConfig,
}

impl RecoveryConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `SAFEKEEP_CONFIG` or the default location, then apply
    /// `SAFEKEEP_DIR`
    ///
    /// A missing default config file yields the defaults; a missing file named
    /// by `SAFEKEEP_CONFIG` is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => {
                let path = default_base_dir().join("config.toml");
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(dir) = std::env::var_os(DIR_ENV) {
            config.storage.dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    /// Storage directory, falling back to `~/.safekeep/store`
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .dir
            .clone()
            .unwrap_or_else(|| default_base_dir().join("store"))
    }

    pub fn snapshot_settings(&self) -> SnapshotSettings {
        let a = &self.autosave;
        SnapshotSettings {
            max_save_points: a.max_save_points.max(1),
            limits: ValidationLimits {
                min_bytes: a.min_state_bytes,
                max_bytes: a.max_state_bytes,
            },
            breaker: BreakerConfig {
                failure_threshold: a.breaker_threshold,
                cooldown: Duration::from_millis(a.breaker_cooldown_ms),
            },
            storage_budget_bytes: self.storage.budget_bytes,
        }
    }

    pub fn autosave_settings(&self) -> AutosaveSettings {
        AutosaveSettings {
            enabled: self.autosave.enabled,
            interval: Duration::from_millis(self.autosave.interval_ms.max(1)),
            focus_save_delay: Duration::from_millis(self.autosave.focus_save_delay_ms),
        }
    }

    pub fn history_config(&self) -> HistoryConfig {
        let h = &self.history;
        HistoryConfig {
            max_history: h.max_history.max(1),
            after_capture_delay: Duration::from_millis(h.after_capture_delay_ms),
            ignored_actions: h.ignored_actions.iter().cloned().collect(),
            critical_actions: h.critical_actions.iter().cloned().collect(),
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        let g = &self.guard;
        GuardConfig {
            enabled: g.enabled,
            prevent_double_clicks: g.prevent_double_clicks,
            prevent_rapid_clicks: g.prevent_rapid_clicks,
            confirm_critical_actions: g.confirm_critical_actions,
            double_click_threshold: Duration::from_millis(g.double_click_threshold_ms),
            rapid_click_threshold: g.rapid_click_threshold,
            spam_click_threshold: g.spam_click_threshold,
            frequency_window: Duration::from_secs(1),
            click_history_len: g.click_history_len,
            confirmation_timeout: Duration::from_millis(g.confirmation_timeout_ms),
            safety_delays: SafetyDelays {
                game_reset: Duration::from_millis(g.safety_delay_game_reset_ms),
                destructive: Duration::from_millis(g.safety_delay_destructive_ms),
                critical: Duration::from_millis(g.safety_delay_critical_ms),
                settings: Duration::from_millis(g.safety_delay_settings_ms),
            },
            warnings: WarningThresholds {
                low_hp: g.low_hp,
                low_score: g.low_score,
                time_running_out: Duration::from_millis(g.time_running_out_ms),
                high_error_rate: g.high_error_rate,
            },
        }
    }
}

/// `~/.safekeep`, or a temp directory if there is no home
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".safekeep"))
        .unwrap_or_else(|| std::env::temp_dir().join("safekeep"))
}
