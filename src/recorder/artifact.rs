//! Recording artifacts
//!
//! The finalized, immutable result of a completed recording, and the
//! store that hands out revocable handles to it.

use crate::utils::error::CaptureResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Revocable reference to a materialized artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    fn generate() -> Self {
        Self(format!("blob:open-capture/{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Finished recording
#[derive(Debug, Clone)]
pub struct Artifact {
    id: Uuid,
    mime_type: String,
    data: Arc<[u8]>,
    handle: ArtifactHandle,
    duration_ms: f64,
    created_at: DateTime<Utc>,
}

/// Artifact metadata without the bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub id: String,
    pub mime_type: String,
    pub byte_len: usize,
    pub handle: ArtifactHandle,
    pub duration_ms: f64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Set the recorded duration before the artifact is published
    pub(crate) fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            id: self.id.to_string(),
            mime_type: self.mime_type.clone(),
            byte_len: self.data.len(),
            handle: self.handle.clone(),
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        }
    }

    /// Suggested file extension for the artifact's encoding
    pub fn extension(&self) -> &'static str {
        let essence = self.mime_type.split(';').next().unwrap_or("").trim();
        match essence {
            "audio/webm" | "video/webm" => "webm",
            "audio/ogg" => "ogg",
            "audio/mp4" | "video/mp4" => "mp4",
            "audio/wav" | "audio/wave" => "wav",
            "audio/pcm" => "pcm",
            _ => "bin",
        }
    }

    /// Write the artifact bytes to `path`
    ///
    /// A path without an extension gets one matching the encoding.
    pub async fn download(&self, path: impl AsRef<Path>) -> CaptureResult<PathBuf> {
        let mut path = path.as_ref().to_path_buf();
        if path.extension().is_none() {
            path.set_extension(self.extension());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, &self.data).await?;

        tracing::info!("Saved {} bytes to {:?}", self.data.len(), path);
        Ok(path)
    }
}

/// Turns ordered chunks into addressable binary objects
pub trait ArtifactStore: Send + Sync {
    /// Concatenate `chunks` in order into one artifact with a live handle
    fn materialize(&self, chunks: Vec<Vec<u8>>, mime_type: &str) -> CaptureResult<Artifact>;

    /// Invalidate `handle`. Returns `false` if it was not live.
    fn revoke(&self, handle: &ArtifactHandle) -> bool;

    fn is_live(&self, handle: &ArtifactHandle) -> bool;

    /// Bytes behind a live handle
    fn resolve(&self, handle: &ArtifactHandle) -> Option<Arc<[u8]>>;
}

/// Process-local artifact store
#[derive(Default)]
pub struct MemoryArtifactStore {
    live: Mutex<HashMap<ArtifactHandle, Arc<[u8]>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn materialize(&self, chunks: Vec<Vec<u8>>, mime_type: &str) -> CaptureResult<Artifact> {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut data = Vec::with_capacity(total);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }

        let data: Arc<[u8]> = Arc::from(data);
        let handle = ArtifactHandle::generate();
        self.live.lock().insert(handle.clone(), data.clone());

        Ok(Artifact {
            id: Uuid::new_v4(),
            mime_type: mime_type.to_string(),
            data,
            handle,
            duration_ms: 0.0,
            created_at: Utc::now(),
        })
    }

    fn revoke(&self, handle: &ArtifactHandle) -> bool {
        let revoked = self.live.lock().remove(handle).is_some();
        if revoked {
            tracing::debug!("Revoked artifact handle {}", handle);
        }
        revoked
    }

    fn is_live(&self, handle: &ArtifactHandle) -> bool {
        self.live.lock().contains_key(handle)
    }

    fn resolve(&self, handle: &ArtifactHandle) -> Option<Arc<[u8]>> {
        self.live.lock().get(handle).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_materialize_concatenates_in_order() {
        let store = MemoryArtifactStore::new();
        let artifact = store
            .materialize(vec![vec![1, 2], vec![], vec![3]], "audio/webm")
            .unwrap();

        assert_eq!(artifact.bytes(), &[1, 2, 3]);
        assert!(store.is_live(artifact.handle()));
        assert_eq!(store.resolve(artifact.handle()).unwrap().len(), 3);
    }

    #[test]
    fn test_revoke_once() {
        let store = MemoryArtifactStore::new();
        let artifact = store.materialize(vec![vec![0; 4]], "audio/webm").unwrap();

        assert!(store.revoke(artifact.handle()));
        assert!(!store.revoke(artifact.handle()));
        assert!(!store.is_live(artifact.handle()));
        // The caller's copy stays readable
        assert_eq!(artifact.len(), 4);
    }

    #[tokio::test]
    async fn test_download_adds_extension() {
        let dir = tempdir().unwrap();
        let store = MemoryArtifactStore::new();
        let artifact = store
            .materialize(vec![b"abc".to_vec()], "audio/webm;codecs=opus")
            .unwrap();

        let path = artifact.download(dir.path().join("take-1")).await.unwrap();

        assert_eq!(path.extension().unwrap(), "webm");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
