// ABOUTME: JSON-file backed ValueStorage for the CLI and long-lived integrations
// ABOUTME: Every write is flushed to disk; the destination id stays in memory only

use anyhow::{Context, Result};
use chatwire_core::paths;
use chatwire_core::storage::{StorageKey, ValueStorage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub struct FileValueStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    destination_id: Uuid,
}

impl FileValueStorage {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), keys = values.len(), "Opened value storage");
        Ok(Self {
            path,
            values: Mutex::new(values),
            destination_id: Uuid::new_v4(),
        })
    }

    /// Open the store in the XDG data directory
    pub fn open_default() -> Result<Self> {
        Self::open(paths::storage_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything currently stored, including keys this version does not know
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let content = serde_json::to_string_pretty(values).context("Failed to serialize storage")?;

        // Readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut values = self.lock();
        change(&mut values);
        if let Err(e) = self.save(&values) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist value storage");
        }
    }
}

impl ValueStorage for FileValueStorage {
    fn get(&self, key: StorageKey) -> Option<String> {
        self.lock().get(key.key()).cloned()
    }

    fn set(&self, key: StorageKey, value: Option<String>) {
        self.update(|values| match value {
            Some(v) => {
                values.insert(key.key().to_string(), v);
            }
            None => {
                values.remove(key.key());
            }
        });
    }

    fn clear_all(&self) {
        self.update(BTreeMap::<String, String>::clear);
        tracing::info!(path = %self.path.display(), "Cleared value storage");
    }

    fn destination_id(&self) -> Uuid {
        self.destination_id
    }
}
