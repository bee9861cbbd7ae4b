// ABOUTME: Content-addressed attachment upload cache.
// ABOUTME: Identical content for the same brand/channel is uploaded once; failures are never cached.

use crate::api::{AttachmentUpload, ChatApi};
use crate::error::{ChatError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hex SHA-256 over (content, brand id, channel id)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &[u8], brand_id: i64, channel_id: &str) -> Self {
        let mut hasher = Sha256::new();
        // Length prefixes keep part boundaries unambiguous
        for part in [content, &brand_id.to_be_bytes(), channel_id.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Map of fingerprint to uploaded file URL
pub type UploadStore = Arc<Mutex<HashMap<Fingerprint, String>>>;

pub struct AttachmentUploadCache {
    api: Arc<dyn ChatApi>,
    store: UploadStore,
}

impl AttachmentUploadCache {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self::with_store(api, UploadStore::default())
    }

    /// Share an externally owned store, e.g. between sessions of one process
    pub fn with_store(api: Arc<dyn ChatApi>, store: UploadStore) -> Self {
        Self { api, store }
    }

    /// Upload `upload` unless identical content already has a URL.
    ///
    /// Racing callers for an uncached fingerprint each make their own request;
    /// whichever succeeds first fills the cache.
    pub async fn upload(&self, upload: &AttachmentUpload, brand_id: i64, channel_id: &str) -> Result<String> {
        let fingerprint = Fingerprint::of(&upload.content, brand_id, channel_id);

        if let Some(url) = self.store.lock().await.get(&fingerprint) {
            tracing::debug!(fingerprint = %fingerprint.as_str(), "Attachment upload served from cache");
            return Ok(url.clone());
        }

        let response = self
            .api
            .upload_attachment(brand_id, channel_id, upload)
            .await
            .map_err(|e| match e {
                ChatError::AttachmentSendFailed(_) => e,
                other => ChatError::AttachmentSendFailed(other.to_string()),
            })?;

        let url = response
            .file_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ChatError::AttachmentSendFailed("upload response had no file URL".to_string()))?;

        let mut store = self.store.lock().await;
        let url = store.entry(fingerprint).or_insert(url).clone();
        tracing::info!(file_name = %upload.file_name, bytes = upload.content.len(), "Attachment uploaded");
        Ok(url)
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.lock().await.is_empty()
    }
}
