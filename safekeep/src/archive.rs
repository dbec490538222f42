//! Persisted layout of the save-point archive
//!
//! Three logical keys live in the backing [`PersistentStore`]:
//! - `safekeep.save_points`: JSON array of [`SavePoint`]
//! - `safekeep.save_metadata`: aggregate counters ([`SaveMetadata`])
//! - `safekeep.emergency`: the [`EmergencyRecord`] slot, written only on host errors
//!
//! The archive does no policy work; eviction and recovery live in
//! [`SnapshotStore`](crate::snapshot_store::SnapshotStore), which makes every
//! write. The CLI reads counters and the emergency slot from here directly.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::models::{EmergencyRecord, SaveMetadata, SavePoint};
use crate::store::PersistentStore;

pub const SAVE_POINTS_KEY: &str = "safekeep.save_points";
pub const METADATA_KEY: &str = "safekeep.save_metadata";
pub const EMERGENCY_KEY: &str = "safekeep.emergency";

/// Bytes used by each archive key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageUsage {
    pub save_points_bytes: u64,
    pub metadata_bytes: u64,
    pub emergency_bytes: u64,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub percent_used: f64,
}

#[derive(Clone)]
pub struct Archive {
    backend: Arc<dyn PersistentStore>,
}

impl Archive {
    pub fn new(backend: Arc<dyn PersistentStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn PersistentStore> {
        &self.backend
    }

    /// Load the save-point list; a missing key is an empty list
    pub fn load_save_points(&self) -> Result<Vec<SavePoint>> {
        match self.backend.get(SAVE_POINTS_KEY)? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(Vec::new()),
        }
    }

    pub fn store_save_points(&self, points: &[SavePoint]) -> Result<()> {
        let bytes = serde_json::to_vec(points)?;
        self.backend.set(SAVE_POINTS_KEY, &bytes)?;
        Ok(())
    }

    pub fn clear_save_points(&self) -> Result<()> {
        self.backend.remove(SAVE_POINTS_KEY)?;
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<SaveMetadata> {
        match self.backend.get(METADATA_KEY)? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(SaveMetadata::default()),
        }
    }

    pub fn store_metadata(&self, metadata: &SaveMetadata) -> Result<()> {
        let bytes = serde_json::to_vec(metadata)?;
        self.backend.set(METADATA_KEY, &bytes)?;
        Ok(())
    }

    pub fn load_emergency(&self) -> Result<Option<EmergencyRecord>> {
        match self.backend.get(EMERGENCY_KEY)? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub fn store_emergency(&self, record: &EmergencyRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.backend.set(EMERGENCY_KEY, &bytes)?;
        Ok(())
    }

    pub fn clear_emergency(&self) -> Result<()> {
        self.backend.remove(EMERGENCY_KEY)?;
        Ok(())
    }

    /// Usage against the backend's capacity, or `default_budget` if it has none
    pub fn usage(&self, default_budget: u64) -> Result<StorageUsage> {
        let save_points_bytes = self.backend.size_of(SAVE_POINTS_KEY)?.unwrap_or(0);
        let metadata_bytes = self.backend.size_of(METADATA_KEY)?.unwrap_or(0);
        let emergency_bytes = self.backend.size_of(EMERGENCY_KEY)?.unwrap_or(0);
        let total_bytes = save_points_bytes + metadata_bytes + emergency_bytes;
        let budget_bytes = self.backend.capacity_bytes().unwrap_or(default_budget);
        let percent_used = if budget_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / budget_bytes as f64 * 100.0
        };

        Ok(StorageUsage {
            save_points_bytes,
            metadata_bytes,
            emergency_bytes,
            total_bytes,
            budget_bytes,
            percent_used,
        })
    }
}
