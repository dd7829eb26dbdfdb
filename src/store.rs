// Token persistence
// A single token record, loaded on every request and replaced on every grant

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::auth::TokenRecord;
use crate::error::StoreError;

/// Durable home of the current token record
pub trait TokenStore {
    /// Load the stored record; any read or parse failure is a cache miss
    fn load(&self) -> Option<TokenRecord>;

    /// Replace the stored record as a whole
    fn save(&self, record: &TokenRecord) -> Result<(), StoreError>;
}

/// JSON token file
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file the record is staged in before the rename
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "token".to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<TokenRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No token file at {}", self.path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read token file {}, treating as absent: {}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };

        match serde_json::from_str::<TokenRecord>(&content) {
            Ok(record) if record.is_complete() => {
                tracing::debug!("Existing token read from {}", self.path.display());
                Some(record)
            }
            Ok(_) => {
                tracing::warn!(
                    "Token file {} holds an incomplete record, treating as absent",
                    self.path.display()
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse token file {}, treating as absent: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        let content = serde_json::to_string_pretty(record)?;
        let staging = self.staging_path();
        fs::write(&staging, content).map_err(|e| self.io_error(e))?;

        // Token file holds bearer credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&staging, perms).map_err(|e| self.io_error(e))?;
        }

        if let Err(e) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(self.io_error(e));
        }

        tracing::debug!("Saved token to {}", self.path.display());
        Ok(())
    }
}

/// In-process store, for embedding and tests
#[derive(Default)]
pub struct MemoryTokenStore {
    record: Mutex<Option<TokenRecord>>,
    saves: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<TokenRecord> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn save(&self, record: &TokenRecord) -> Result<(), StoreError> {
        *self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
