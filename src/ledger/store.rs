//! Ledger storage backends

use super::{CampaignLedger, LedgerError, LedgerResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Narrow persistence interface for a campaign ledger
pub trait LedgerStore: Send + Sync {
    /// Read the stored ledger, `Ok(None)` if nothing has been stored yet
    fn load(&self) -> LedgerResult<Option<CampaignLedger>>;

    /// Replace the stored ledger
    fn save(&self, ledger: &CampaignLedger) -> LedgerResult<()>;

    /// Human-readable location for log lines
    fn location(&self) -> String;
}

/// Ledger stored as a pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for the list identified by `identity` inside `progress_dir`
    pub fn for_source(progress_dir: &Path, identity: &str) -> Self {
        Self::new(progress_dir.join(format!("{}_progress.json", identity)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable ledger is copied before it can be overwritten
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> LedgerResult<Option<CampaignLedger>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| LedgerError::Io(format!("Failed to read {}: {}", self.path.display(), e)))?;
        match serde_json::from_str(&json) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(e) => {
                // The next save replaces the file, keep the unreadable history aside
                let backup = self.backup_path();
                match std::fs::copy(&self.path, &backup) {
                    Ok(_) => tracing::warn!("Copied unreadable ledger to {}", backup.display()),
                    Err(copy_err) => tracing::error!(
                        "Failed to back up unreadable ledger {}: {}",
                        self.path.display(),
                        copy_err
                    ),
                }
                Err(LedgerError::Corrupt(e.to_string()))
            }
        }
    }

    fn save(&self, ledger: &CampaignLedger) -> LedgerResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| LedgerError::Io(format!("Failed to create progress directory: {}", e)))?;

        // Readers see either the previous file or the new one, never a partial write
        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| LedgerError::Io(format!("Failed to create temp file: {}", e)))?;
        serde_json::to_writer_pretty(&mut temp, ledger)
            .map_err(|e| LedgerError::Serialize(e.to_string()))?;
        temp.flush()
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| LedgerError::Io(format!("Failed to flush ledger: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| LedgerError::Io(format!("Failed to replace {}: {}", self.path.display(), e)))?;

        tracing::debug!("Wrote ledger to {}", self.path.display());
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process store holding the serialized ledger; clones share contents
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    contents: Arc<Mutex<Option<String>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with raw serialized contents
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: Arc::new(Mutex::new(Some(contents.into()))),
        }
    }

    /// Raw serialized contents, if anything was stored
    pub fn contents(&self) -> Option<String> {
        self.contents.lock().ok().and_then(|guard| guard.clone())
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> LedgerResult<Option<CampaignLedger>> {
        let guard = self
            .contents
            .lock()
            .map_err(|_| LedgerError::Io("ledger lock poisoned".to_string()))?;
        match guard.as_deref() {
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| LedgerError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    fn save(&self, ledger: &CampaignLedger) -> LedgerResult<()> {
        let json = serde_json::to_string(ledger).map_err(|e| LedgerError::Serialize(e.to_string()))?;
        let mut guard = self
            .contents
            .lock()
            .map_err(|_| LedgerError::Io("ledger lock poisoned".to_string()))?;
        *guard = Some(json);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
