//! Enrollment persistence: exactly one record per profile.

use crate::types::EnrollmentRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Profile key used when none is configured.
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("enrollment storage unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("failed to serialize enrollment record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable home of the single [`EnrollmentRecord`].
///
/// `save` replaces the previous record atomically: on error the prior record
/// is left untouched. `load` never fails; a missing or unreadable record is
/// reported as `None`.
pub trait EnrollmentStore: Send + Sync {
    fn save(&self, record: &EnrollmentRecord) -> Result<(), StoreError>;
    fn load(&self) -> Option<EnrollmentRecord>;
    /// Remove the record. Succeeds when nothing is stored.
    fn clear(&self) -> Result<(), StoreError>;
}

/// JSON file at `<dir>/<profile>.json`.
///
/// Writes go to a unique sibling temp file that is fsynced and renamed over
/// the target, so concurrent writers (threads or processes) are
/// last-writer-wins and readers never observe a partial record.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileStore {
    pub fn new(dir: impl AsRef<Path>, profile: &str) -> Self {
        let path = dir.as_ref().join(format!("{}.json", sanitize_profile(profile)));
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
    }

    fn write_atomic(&self, contents: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp = self.temp_path();
        let result = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&temp, &self.path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

impl EnrollmentStore for FileStore {
    fn save(&self, record: &EnrollmentRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_atomic(&json)?;
        tracing::info!(
            path = %self.path.display(),
            created_at = %record.created_at,
            "enrollment saved"
        );
        Ok(())
    }

    fn load(&self) -> Option<EnrollmentRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "enrollment unreadable; treating as absent"
                );
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "enrollment corrupted; treating as absent"
                );
                None
            }
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "enrollment cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep profile keys usable as file names.
fn sanitize_profile(profile: &str) -> String {
    let cleaned: String = profile
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        DEFAULT_PROFILE.to_string()
    } else {
        cleaned
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    record: RwLock<Option<EnrollmentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnrollmentStore for MemoryStore {
    fn save(&self, record: &EnrollmentRecord) -> Result<(), StoreError> {
        *self.record.write().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> Option<EnrollmentRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.record.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
