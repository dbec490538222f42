//! Persistent key-value stores
//!
//! [`PersistentStore`] is the only storage contract the recovery layer
//! relies on. Two backends ship with the crate:
//! - [`MemoryStore`]: in-process map with an optional byte budget
//! - [`FileStore`]: one file per key with atomic writes (temp file + fsync +
//!   rename), strict permissions (0600 files, 0700 dirs), a per-directory
//!   lock and bounded startup cleanup of stale temp files

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::error::StoreError;

/// Maximum number of files to scan during cleanup
const CLEANUP_SCAN_LIMIT: usize = 1000;

/// Age threshold for temp file cleanup (1 hour)
const CLEANUP_AGE_THRESHOLD: Duration = Duration::from_secs(3600);

/// How long a writer waits for the directory lock
const LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Byte store with a capacity-exceeded failure signal
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Fails with [`StoreError::CapacityExceeded`] when the value does not fit
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn size_of(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.get(key)?.map(|v| v.len() as u64))
    }

    /// Total byte budget, if the backend enforces one
    fn capacity_bytes(&self) -> Option<u64> {
        None
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    capacity: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: Some(capacity_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.lock();
        if let Some(capacity) = self.capacity {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            let needed = value.len() as u64;
            if others + needed > capacity {
                return Err(StoreError::CapacityExceeded {
                    key: key.to_string(),
                    needed,
                    available: capacity.saturating_sub(others),
                });
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// File-per-key store
///
/// Layout: `<dir>/<key>.json`. Keys are restricted to `[A-Za-z0-9._-]`;
/// anything else is replaced with `_`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    capacity: Option<u64>,
    /// Whether the store is available (directory successfully created)
    available: bool,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// If the directory cannot be created, the store is marked unavailable and
    /// every operation fails with [`StoreError::Unavailable`].
    pub fn new(dir: &Path) -> Self {
        let available = Self::ensure_dir(dir);
        let store = Self {
            dir: dir.to_path_buf(),
            capacity: None,
            available,
        };
        if available {
            if let Err(e) = store.cleanup_stale_temps() {
                tracing::warn!(dir = %dir.display(), error = %e, "stale temp cleanup failed");
            }
        }
        store
    }

    pub fn with_capacity(dir: &Path, capacity_bytes: u64) -> Self {
        Self {
            capacity: Some(capacity_bytes),
            ..Self::new(dir)
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(dir: &Path) -> bool {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                        tracing::warn!(dir = %dir.display(), error = %e, "failed to set store permissions");
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "failed to create store directory");
                false
            }
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "directory {} could not be created",
                self.dir.display()
            )))
        }
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::sanitize_key(key)))
    }

    /// Stored keys with their on-disk sizes, sorted by key
    pub fn entries(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.check_available()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                entries.push((stem.to_string(), entry.metadata()?.len()));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn used_bytes_excluding(&self, key_path: &Path) -> io::Result<u64> {
        let mut used = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == key_path || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            used += entry.metadata()?.len();
        }
        Ok(used)
    }

    /// Delete `*.tmp.*` files older than an hour
    ///
    /// Scans at most CLEANUP_SCAN_LIMIT files to avoid blocking startup.
    /// Returns (deleted_count, scanned_count, hit_limit)
    pub fn cleanup_stale_temps(&self) -> io::Result<(usize, usize, bool)> {
        if !self.available {
            return Ok((0, 0, false));
        }

        let mut scanned = 0;
        let mut deleted = 0;
        let now = SystemTime::now();

        for entry in walkdir::WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if scanned >= CLEANUP_SCAN_LIMIT {
                tracing::warn!(
                    limit = CLEANUP_SCAN_LIMIT,
                    dir = %self.dir.display(),
                    "hit cleanup scan limit"
                );
                return Ok((deleted, scanned, true));
            }

            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            scanned += 1;

            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.contains(".tmp."));
            if !is_temp {
                continue;
            }

            let age = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > CLEANUP_AGE_THRESHOLD) {
                match fs::remove_file(path) {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to delete stale temp file")
                    }
                }
            }
        }

        Ok((deleted, scanned, false))
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let _lock = acquire_dir_lock(&self.dir.join(".lock"), LOCK_TIMEOUT)?;

        let final_path = self.key_path(key);

        if let Some(capacity) = self.capacity {
            let others = self.used_bytes_excluding(&final_path)?;
            let needed = value.len() as u64;
            if others + needed > capacity {
                return Err(StoreError::CapacityExceeded {
                    key: key.to_string(),
                    needed,
                    available: capacity.saturating_sub(others),
                });
            }
        }

        let temp_path = self.dir.join(format!(
            "{}.json.tmp.{}",
            Self::sanitize_key(key),
            std::process::id()
        ));

        let mut file = File::create(&temp_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn size_of(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        match fs::metadata(self.key_path(key)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// Acquire a flock on the lock file with timeout
///
/// Returns the file handle which holds the lock (lock is released on drop)
fn acquire_dir_lock(lock_path: &Path, timeout: Duration) -> io::Result<File> {
    use fs2::FileExt;

    let start = Instant::now();
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "Failed to acquire store lock within timeout",
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
}
