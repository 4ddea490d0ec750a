// Media uploads: bytes go to blob storage, the returned reference is embedded into a later send
use crate::common::error::{ChatError, ChatResult};
use crate::common::models::{Attachment, MessageType};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `path` and returns a publicly retrievable URL.
    async fn put(&self, path: &str, bytes: &[u8], mime_type: &str) -> ChatResult<String>;
}

/// Blob storage on the local filesystem, served elsewhere under `public_base`.
pub struct LocalBlobStore {
    root: PathBuf,
    public_base: Url,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base: &str) -> ChatResult<Self> {
        let mut base = public_base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let public_base =
            Url::parse(&base).map_err(|e| ChatError::InvalidInput(format!("invalid blob public url {}: {}", public_base, e)))?;
        Ok(Self { root: root.into(), public_base })
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], _mime_type: &str) -> ChatResult<String> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ChatError::Upload(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| ChatError::Upload(format!("cannot write {}: {}", target.display(), e)))?;

        // Each piece is percent-encoded, so names with '#', '?' or '%' stay inside the path
        let mut url = self.public_base.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Upload(format!("{} cannot carry a path", self.public_base)))?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url.to_string())
    }
}

fn mime_from_extension(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

/// Keeps the name a single path segment.
fn sanitize_file_name(name: &str) -> String {
    name.trim().replace(['/', '\\'], "_")
}

pub struct AttachmentUploader {
    blobs: Arc<dyn BlobStore>,
    max_bytes: usize,
}

impl AttachmentUploader {
    pub fn new(blobs: Arc<dyn BlobStore>, max_bytes: usize) -> Self {
        Self { blobs, max_bytes }
    }

    /// Uploads an image or document for `conversation_id`. Nothing is rolled back
    /// if the send that should reference the blob later fails.
    pub async fn upload(
        &self,
        payload: &[u8],
        file_name: Option<&str>,
        mime_type: Option<&str>,
        conversation_id: &str,
        kind: MessageType,
    ) -> ChatResult<Attachment> {
        if !kind.carries_media() {
            return Err(ChatError::InvalidInput(format!("{} is not an attachment kind", kind)));
        }
        if payload.is_empty() {
            return Err(ChatError::Upload("empty payload".to_string()));
        }
        if payload.len() > self.max_bytes {
            return Err(ChatError::Upload(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_bytes
            )));
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        let file_name = file_name
            .map(sanitize_file_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}_{}", kind, timestamp_ms));
        let mime_type = mime_type
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| mime_from_extension(&file_name).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let path = format!("conversations/{}/{}s/{}_{}", conversation_id, kind, timestamp_ms, file_name);
        let url = self.blobs.put(&path, payload, &mime_type).await.map_err(|e| {
            error!("[UPLOAD] Failed to store {}: {}", path, e);
            match e {
                ChatError::Upload(_) => e,
                other => ChatError::Upload(other.to_string()),
            }
        })?;

        info!("[UPLOAD] Stored {} ({} bytes, {})", path, payload.len(), mime_type);
        Ok(Attachment {
            url,
            file_name,
            file_size: payload.len() as u64,
            mime_type,
        })
    }
}
