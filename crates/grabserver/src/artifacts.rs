//! One-time download tokens for finished artifacts.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::File;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub download_name: String,
}

/// Token → artifact mapping. `retrieve` must remove and return the entry in
/// one indivisible step so a token is honoured at most once.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn register(&self, token: String, artifact: Artifact);

    async fn retrieve(&self, token: &str) -> Option<Artifact>;
}

/// Process-local store for single-instance deployments.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<HashMap<String, Artifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn register(&self, token: String, artifact: Artifact) {
        self.entries.lock().insert(token, artifact);
    }

    async fn retrieve(&self, token: &str) -> Option<Artifact> {
        self.entries.lock().remove(token)
    }
}

/// 128 bits from the OS CSPRNG (122 of them random), hex encoded.
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Remove a file the service created. Failures are returned for the caller
/// to log; a file that is already gone counts as removed.
pub fn remove_artifact(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Deletes the wrapped file when dropped, i.e. once the response body that
/// owns it has finished or been abandoned.
#[derive(Debug)]
pub struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match remove_artifact(&self.0) {
            Ok(()) => tracing::debug!("removed served artifact {}", self.0.display()),
            Err(e) => tracing::warn!("cleanup failed for {}: {e}", self.0.display()),
        }
    }
}

/// A consumed token, ready to stream.
#[derive(Debug)]
pub struct ConsumedArtifact {
    pub file: File,
    pub len: u64,
    pub download_name: String,
    pub cleanup: RemoveOnDrop,
}

/// Redeem `token`: the entry is gone from the store before the file is even
/// opened. A missing file is reported as not found and left alone.
pub async fn consume(store: &dyn ArtifactStore, token: &str) -> Result<ConsumedArtifact> {
    let artifact = store
        .retrieve(token)
        .await
        .ok_or(Error::ArtifactNotFound("Link expired or invalid"))?;

    let file = File::open(&artifact.path).await.map_err(|e| {
        tracing::warn!("artifact {} unavailable: {e}", artifact.path.display());
        Error::ArtifactNotFound("File not found")
    })?;
    let cleanup = RemoveOnDrop(artifact.path);
    let len = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|_| Error::ArtifactNotFound("File not found"))?;

    Ok(ConsumedArtifact {
        file,
        len,
        download_name: artifact.download_name,
        cleanup,
    })
}
