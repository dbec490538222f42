//! Persisted save-point models

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::capture::{validate_snapshot, StateSnapshot, ValidationLimits, ValidationReport};
use crate::error::ValidationError;

/// Unique identifier for a save point
/// Format: "save_1767225600000_k3j9x0a1b"
pub type SavePointId = String;

/// What triggered a save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveType {
    Initial,
    Periodic,
    Manual,
    Final,
    Emergency,
    BeforeCritical,
    BeforeUnload,
    WindowBlur,
    WindowFocus,
    GameStart,
    GameEnd,
    Destroy,
}

impl SaveType {
    pub const ALL: [SaveType; 12] = [
        SaveType::Initial,
        SaveType::Periodic,
        SaveType::Manual,
        SaveType::Final,
        SaveType::Emergency,
        SaveType::BeforeCritical,
        SaveType::BeforeUnload,
        SaveType::WindowBlur,
        SaveType::WindowFocus,
        SaveType::GameStart,
        SaveType::GameEnd,
        SaveType::Destroy,
    ];

    /// Eviction priority; higher survives longer
    pub fn priority(self) -> u8 {
        match self {
            SaveType::Emergency => 10,
            SaveType::BeforeCritical => 9,
            SaveType::GameEnd => 8,
            SaveType::BeforeUnload => 7,
            SaveType::Final => 6,
            SaveType::Manual => 5,
            SaveType::GameStart => 4,
            SaveType::Initial => 3,
            SaveType::WindowBlur => 2,
            SaveType::WindowFocus => 1,
            SaveType::Periodic => 1,
            SaveType::Destroy => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SaveType::Initial => "initial",
            SaveType::Periodic => "periodic",
            SaveType::Manual => "manual",
            SaveType::Final => "final",
            SaveType::Emergency => "emergency",
            SaveType::BeforeCritical => "before_critical",
            SaveType::BeforeUnload => "before_unload",
            SaveType::WindowBlur => "window_blur",
            SaveType::WindowFocus => "window_focus",
            SaveType::GameStart => "game_start",
            SaveType::GameEnd => "game_end",
            SaveType::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for SaveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SaveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaveType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown save type: {}", s))
    }
}

/// Stored snapshot plus the metadata used for eviction and integrity
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavePoint {
    pub id: SavePointId,
    pub captured_at: DateTime<Utc>,
    pub save_type: SaveType,
    pub snapshot: StateSnapshot,
    pub size_bytes: u64,
    /// Strictly increasing across the lifetime of the store
    pub save_index: u64,
    /// SHA-256 of the serialized snapshot
    pub checksum: String,
}

impl SavePoint {
    pub fn new(
        id: SavePointId,
        save_type: SaveType,
        snapshot: StateSnapshot,
        save_index: u64,
    ) -> Result<Self, serde_json::Error> {
        let checksum = snapshot.checksum()?;
        Ok(Self {
            id,
            captured_at: snapshot.captured_at,
            save_type,
            size_bytes: snapshot.size_bytes(),
            snapshot,
            save_index,
            checksum,
        })
    }

    pub fn priority(&self) -> u8 {
        self.save_type.priority()
    }

    /// Recompute the checksum and validate the payload
    pub fn verify(&self, limits: &ValidationLimits) -> Result<ValidationReport, ValidationError> {
        verify_checksum(&self.snapshot, &self.checksum)?;
        validate_snapshot(&self.snapshot, limits)
    }
}

/// Aggregate counters persisted next to the save-point list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveMetadata {
    pub total_saves: u64,
    pub total_restores: u64,
    pub total_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_save_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_save_type: Option<SaveType>,
    /// Highest index ever handed out, so an emptied list cannot reset it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_save_index: Option<u64>,
}

/// Out-of-band copy written when the host reports an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRecord {
    pub snapshot: StateSnapshot,
    pub error_message: String,
    pub recorded_at: DateTime<Utc>,
    pub checksum: String,
}

impl EmergencyRecord {
    pub fn new(
        snapshot: StateSnapshot,
        error_message: String,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let checksum = snapshot.checksum()?;
        Ok(Self {
            snapshot,
            error_message,
            recorded_at,
            checksum,
        })
    }

    pub fn verify(&self, limits: &ValidationLimits) -> Result<ValidationReport, ValidationError> {
        verify_checksum(&self.snapshot, &self.checksum)?;
        validate_snapshot(&self.snapshot, limits)
    }
}

fn verify_checksum(snapshot: &StateSnapshot, expected: &str) -> Result<(), ValidationError> {
    // An unserializable snapshot cannot match any stored checksum
    let actual = snapshot.checksum().unwrap_or_default();
    if actual != expected {
        return Err(ValidationError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Build a save id from the capture time and nine random base36 characters
pub fn generate_save_id(now: DateTime<Utc>) -> SavePointId {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("save_{}_{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StateSections;

    fn snapshot() -> StateSnapshot {
        let mut sections = StateSections::new();
        sections.insert("player".to_string(), serde_json::json!({"score": 10}));
        StateSnapshot::new(Utc::now(), Some("s-1".to_string()), sections)
    }

    #[test]
    fn test_priorities_order_emergency_first() {
        assert_eq!(SaveType::Emergency.priority(), 10);
        assert_eq!(SaveType::Periodic.priority(), 1);
        assert_eq!(SaveType::Destroy.priority(), 0);
        assert!(SaveType::BeforeCritical.priority() > SaveType::Manual.priority());
        assert_eq!(
            SaveType::WindowFocus.priority(),
            SaveType::Periodic.priority()
        );
    }

    #[test]
    fn test_save_type_string_forms_agree() {
        for save_type in SaveType::ALL {
            let json = serde_json::to_string(&save_type).unwrap();
            assert_eq!(json, format!("\"{}\"", save_type));
            assert_eq!(save_type.as_str().parse::<SaveType>().unwrap(), save_type);
        }
        assert!("bogus".parse::<SaveType>().is_err());
    }

    #[test]
    fn test_save_id_format() {
        let now = Utc::now();
        let id = generate_save_id(now);
        let parts: Vec<&str> = id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "save");
        assert_eq!(parts[1], now.timestamp_millis().to_string());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_save_id(now), generate_save_id(now));
    }

    #[test]
    fn test_save_point_verifies_its_own_checksum() {
        let point = SavePoint::new("save_1_a".into(), SaveType::Manual, snapshot(), 0).unwrap();
        assert!(point.verify(&ValidationLimits::default()).is_ok());
        assert_eq!(point.size_bytes, point.snapshot.size_bytes());
        assert_eq!(point.captured_at, point.snapshot.captured_at);
    }

    #[test]
    fn test_tampered_save_point_fails_verification() {
        let mut point =
            SavePoint::new("save_1_a".into(), SaveType::Manual, snapshot(), 0).unwrap();
        point
            .snapshot
            .sections
            .insert("player".to_string(), serde_json::json!({"score": 99999}));

        assert!(matches!(
            point.verify(&ValidationLimits::default()),
            Err(ValidationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_metadata_defaults_when_fields_missing() {
        let metadata: SaveMetadata = serde_json::from_str(r#"{"total_saves": 4}"#).unwrap();
        assert_eq!(metadata.total_saves, 4);
        assert_eq!(metadata.total_errors, 0);
        assert_eq!(metadata.last_save_index, None);

        let json = serde_json::to_string(&SaveMetadata::default()).unwrap();
        assert!(!json.contains("last_save_at"));
    }

    #[test]
    fn test_save_point_serde_roundtrip() {
        let point =
            SavePoint::new("save_1_a".into(), SaveType::BeforeCritical, snapshot(), 7).unwrap();
        let json = serde_json::to_string_pretty(&point).unwrap();
        let back: SavePoint = serde_json::from_str(&json).unwrap();

        assert_eq!(point, back);
        assert!(json.contains("\"save_type\": \"before_critical\""));
        assert!(back.verify(&ValidationLimits::default()).is_ok());
    }
}
