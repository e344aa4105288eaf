//! Content-addressed artifact store.
//!
//! Bytes are keyed by their `sha256:` digest inside a namespace derived from
//! one `(planDigest, blockHash)` pair, so content written for one execution
//! can never answer a lookup scoped to another. Digests are immutable once
//! written, and `get` re-hashes what it read before handing it out.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::canonical::{canonical_json, is_digest, sha256_digest, DIGEST_PREFIX};
use crate::reason;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("malformed digest: {0}")]
    MalformedDigest(String),
    /// Bytes do not hash to the digest they were stored or requested under.
    #[error("artifact digest mismatch for {digest} (bytes hash to {actual})")]
    DigestMismatch { digest: String, actual: String },
    /// A digest already holds different bytes.
    #[error("artifact {0} already stored with different bytes")]
    Tampered(String),
    #[error("artifact store I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl ArtifactError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ArtifactError::NotFound(_) => reason::ARTIFACT_MISSING,
            ArtifactError::MalformedDigest(_) | ArtifactError::DigestMismatch { .. } => {
                reason::ARTIFACT_DIGEST_MISMATCH
            }
            ArtifactError::Tampered(_) => reason::ARTIFACT_TAMPERED,
            ArtifactError::Io(_) => reason::ARTIFACT_STORE_IO,
        }
    }
}

/// Raw byte storage behind the store. Backends never verify; the store does.
pub trait ArtifactBackend: Send + Sync {
    fn read(&self, namespace: &str, digest: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Writes only if absent. Returns `false` when the key already existed.
    fn write_new(&self, namespace: &str, digest: &str, bytes: &[u8]) -> std::io::Result<bool>;
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "artifact store lock poisoned")
}

impl ArtifactBackend for MemoryBackend {
    fn read(&self, namespace: &str, digest: &str) -> std::io::Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .get(&(namespace.to_string(), digest.to_string()))
            .cloned())
    }

    fn write_new(&self, namespace: &str, digest: &str, bytes: &[u8]) -> std::io::Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let key = (namespace.to_string(), digest.to_string());
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, bytes.to_vec());
        Ok(true)
    }
}

/// On-disk backend.
///
/// Layout:
///   {root}/{namespace hex}/{digest hex}
///
/// Writes are staged in a `.staging-*` file in the same directory and linked
/// into place only once complete.
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn open(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, namespace: &str, digest: &str) -> PathBuf {
        self.root
            .join(strip_prefix(namespace))
            .join(strip_prefix(digest))
    }
}

const STAGING_PREFIX: &str = ".staging-";

fn strip_prefix(digest: &str) -> &str {
    digest.strip_prefix(DIGEST_PREFIX).unwrap_or(digest)
}

impl ArtifactBackend for DirBackend {
    fn read(&self, namespace: &str, digest: &str) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(namespace, digest)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_new(&self, namespace: &str, digest: &str, bytes: &[u8]) -> std::io::Result<bool> {
        let path = self.path_for(namespace, digest);
        let parent = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;

        // Staged next to the target; dropped (and removed) on any error, so a
        // short write never lands under the digest's name.
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(parent)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;

        match staged.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error),
        }
    }
}

/// Content-addressed store scoped to one `(planDigest, blockHash)` pair.
pub struct ArtifactStore {
    plan_digest: String,
    block_hash: String,
    namespace: String,
    backend: Box<dyn ArtifactBackend>,
}

impl ArtifactStore {
    /// In-memory store for one execution.
    pub fn in_memory(plan_digest: &str, block_hash: &str) -> Self {
        Self::with_backend(plan_digest, block_hash, Box::new(MemoryBackend::new()))
    }

    pub fn with_backend(
        plan_digest: &str,
        block_hash: &str,
        backend: Box<dyn ArtifactBackend>,
    ) -> Self {
        Self {
            plan_digest: plan_digest.to_string(),
            block_hash: block_hash.to_string(),
            namespace: namespace_for(plan_digest, block_hash),
            backend,
        }
    }

    pub fn plan_digest(&self) -> &str {
        &self.plan_digest
    }

    pub fn block_hash(&self) -> &str {
        &self.block_hash
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stores `bytes` under `digest`.
    ///
    /// The bytes must hash to `digest`. Writing the same bytes twice is a
    /// no-op; an existing entry holding anything else is reported as tampering
    /// and left untouched.
    pub fn put(&self, digest: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        if !is_digest(digest) {
            return Err(ArtifactError::MalformedDigest(digest.to_string()));
        }
        let actual = sha256_digest(bytes);
        if actual != digest {
            warn!("Refusing artifact put: {digest} does not match bytes ({actual})");
            return Err(ArtifactError::DigestMismatch {
                digest: digest.to_string(),
                actual,
            });
        }

        if self.backend.write_new(&self.namespace, digest, bytes)? {
            debug!("Stored artifact {digest} ({} bytes)", bytes.len());
            return Ok(());
        }

        match self.backend.read(&self.namespace, digest)? {
            Some(existing) if existing == bytes => Ok(()),
            _ => {
                warn!("Artifact {digest} already holds different bytes");
                Err(ArtifactError::Tampered(digest.to_string()))
            }
        }
    }

    /// Returns the bytes stored under `digest`, after re-hashing them.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>, ArtifactError> {
        if !is_digest(digest) {
            return Err(ArtifactError::MalformedDigest(digest.to_string()));
        }
        let bytes = self
            .backend
            .read(&self.namespace, digest)?
            .ok_or_else(|| ArtifactError::NotFound(digest.to_string()))?;

        let actual = sha256_digest(&bytes);
        if actual != digest {
            warn!("Artifact {digest} failed re-hash on read ({actual})");
            return Err(ArtifactError::DigestMismatch {
                digest: digest.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.get(digest).is_ok()
    }
}

/// Namespace key for a `(planDigest, blockHash)` pair.
pub fn namespace_for(plan_digest: &str, block_hash: &str) -> String {
    let scope = json!({ "blockHash": block_hash, "planDigest": plan_digest });
    sha256_digest(canonical_json(&scope).as_bytes())
}
