//! State capture: turning the live host into immutable snapshots and back
//!
//! The host exposes its state through [`HostApplication`]. Most hosts build
//! one from a [`CapabilityRegistry`], registering one [`Exportable`] per
//! subsystem. Each capability hands back an owned, typed copy of its state,
//! which is then serialized into a named section of the snapshot. A
//! serialization failure is an error, never a silently dropped field.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock};
use crate::error::{ApplyError, RecoveryError, Result, ValidationError};

/// Current snapshot layout version
pub const SCHEMA_VERSION: u32 = 1;

/// Serialized state keyed by capability name
pub type StateSections = BTreeMap<String, Value>;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Immutable copy of host state at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Missing timestamps deserialize as the Unix epoch and fail validation
    #[serde(default)]
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub sections: StateSections,
}

impl StateSnapshot {
    pub fn new(
        captured_at: DateTime<Utc>,
        session_id: Option<String>,
        sections: StateSections,
    ) -> Self {
        Self {
            captured_at,
            session_id,
            schema_version: SCHEMA_VERSION,
            sections,
        }
    }

    /// Decode one section into its typed form
    ///
    /// Returns None when the section is absent.
    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T>> {
        self.sections
            .get(name)
            .map(|value| serde_json::from_value(value.clone()).map_err(RecoveryError::from))
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Serialized size; anything that cannot be serialized counts as oversized
    pub fn size_bytes(&self) -> u64 {
        self.to_bytes()
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(u64::MAX)
    }

    /// SHA-256 over the serialized payload, hex encoded
    pub fn checksum(&self) -> std::result::Result<String, serde_json::Error> {
        let bytes = self.to_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// How to treat a failing section during import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Stop at the first failing section and report it
    Strict,
    /// Apply every section that can be applied and report the rest
    BestEffort,
}

/// Outcome of writing a snapshot back into the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Sections with no matching capability, or capabilities with no section
    pub skipped: Vec<String>,
    pub failed: Vec<ApplyError>,
}

impl ApplyReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Contract the host application implements
pub trait HostApplication: Send + Sync {
    fn export_state(&self) -> Result<StateSections>;

    fn import_state(
        &self,
        sections: &StateSections,
        policy: ApplyPolicy,
    ) -> std::result::Result<ApplyReport, ApplyError>;

    fn session_id(&self) -> Option<String> {
        None
    }
}

/// One subsystem's ability to export and re-import its own state
pub trait Exportable: Send + Sync {
    type State: Clone + Serialize + DeserializeOwned + Send + 'static;

    fn export_state(&self) -> Self::State;

    fn import_state(&self, state: Self::State) -> std::result::Result<(), String>;
}

trait ErasedCapability: Send + Sync {
    fn export_value(&self) -> std::result::Result<Value, serde_json::Error>;
    fn import_value(&self, value: &Value) -> std::result::Result<(), String>;
}

struct Capability<E>(Arc<E>);

impl<E> ErasedCapability for Capability<E>
where
    E: Exportable + 'static,
{
    fn export_value(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::to_value(self.0.export_state())
    }

    fn import_value(&self, value: &Value) -> std::result::Result<(), String> {
        let state: E::State = serde_json::from_value(value.clone())
            .map_err(|e| format!("malformed section: {}", e))?;
        self.0.import_state(state)
    }
}

/// Typed registry of capabilities, populated once by the host
///
/// Sections are exported and imported in registration order.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<(String, Box<dyn ErasedCapability>)>,
    session_id: Option<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Register a capability under `name`, replacing any previous one
    pub fn register<E>(&mut self, name: impl Into<String>, capability: Arc<E>) -> &mut Self
    where
        E: Exportable + 'static,
    {
        let name = name.into();
        let boxed: Box<dyn ErasedCapability> = Box::new(Capability(capability));
        if let Some(slot) = self.capabilities.iter_mut().find(|(n, _)| *n == name) {
            tracing::warn!(section = %name, "replacing registered capability");
            slot.1 = boxed;
        } else {
            self.capabilities.push((name, boxed));
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(|(n, _)| n.as_str())
    }
}

impl HostApplication for CapabilityRegistry {
    fn export_state(&self) -> Result<StateSections> {
        let mut sections = StateSections::new();
        for (name, capability) in &self.capabilities {
            let value = capability
                .export_value()
                .map_err(|e| RecoveryError::Capture(format!("section `{}`: {}", name, e)))?;
            sections.insert(name.clone(), value);
        }
        Ok(sections)
    }

    fn import_state(
        &self,
        sections: &StateSections,
        policy: ApplyPolicy,
    ) -> std::result::Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();

        for (name, capability) in &self.capabilities {
            let Some(value) = sections.get(name) else {
                tracing::debug!(section = %name, "snapshot has no data for capability");
                report.skipped.push(name.clone());
                continue;
            };

            match capability.import_value(value) {
                Ok(()) => report.applied.push(name.clone()),
                Err(message) => {
                    let err = ApplyError::new(name.clone(), message);
                    match policy {
                        ApplyPolicy::Strict => return Err(err),
                        ApplyPolicy::BestEffort => {
                            tracing::warn!(error = %err, "skipping section during best-effort import");
                            report.failed.push(err);
                        }
                    }
                }
            }
        }

        for name in sections.keys() {
            if !self.contains(name) {
                tracing::debug!(section = %name, "no capability registered for section");
                report.skipped.push(name.clone());
            }
        }

        Ok(report)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

/// Produces snapshots from a host and applies them back
#[derive(Clone)]
pub struct StateCapture {
    host: Arc<dyn HostApplication>,
    clock: Arc<dyn Clock>,
}

impl StateCapture {
    pub fn new(host: Arc<dyn HostApplication>) -> Self {
        Self::with_clock(host, Arc::new(SystemClock))
    }

    pub fn with_clock(host: Arc<dyn HostApplication>, clock: Arc<dyn Clock>) -> Self {
        Self { host, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn capture(&self) -> Result<StateSnapshot> {
        let sections = self.host.export_state()?;
        Ok(StateSnapshot::new(
            self.clock.now_datetime(),
            self.host.session_id(),
            sections,
        ))
    }

    pub fn apply(
        &self,
        snapshot: &StateSnapshot,
        policy: ApplyPolicy,
    ) -> std::result::Result<ApplyReport, ApplyError> {
        self.host.import_state(&snapshot.sections, policy)
    }
}

/// Size bounds for a valid snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Smaller payloads are accepted with a warning
    pub min_bytes: u64,
    pub max_bytes: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_bytes: 10,
            max_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Result of a successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub size_bytes: u64,
    pub warnings: Vec<String>,
}

/// Check that a snapshot is worth keeping
pub fn validate_snapshot(
    snapshot: &StateSnapshot,
    limits: &ValidationLimits,
) -> std::result::Result<ValidationReport, ValidationError> {
    if snapshot.captured_at.timestamp_millis() <= 0 {
        return Err(ValidationError::MissingTimestamp);
    }
    if snapshot.sections.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    let size_bytes = snapshot.size_bytes();
    if size_bytes > limits.max_bytes {
        return Err(ValidationError::TooLarge {
            size: size_bytes,
            max: limits.max_bytes,
        });
    }

    let mut warnings = Vec::new();
    if size_bytes < limits.min_bytes {
        warnings.push(format!("snapshot is only {} bytes", size_bytes));
    }
    if snapshot.session_id.is_none() {
        warnings.push("snapshot has no session id".to_string());
    }

    Ok(ValidationReport {
        size_bytes,
        warnings,
    })
}
