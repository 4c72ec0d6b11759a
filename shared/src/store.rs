//! Content-addressed storage for large binaries
//!
//! Program sources/binaries and buffer contents are written once per unique
//! SHA-256 digest and referenced from trace records by [`ContentRef`]. Two
//! update records carrying identical bytes share one stored blob.

use crate::utils::bytes_to_hex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Hex-encoded SHA-256 digest of a stored blob
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentRef(pub String);

impl ContentRef {
    /// Digest of `bytes`
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        ContentRef(bytes_to_hex(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell blobs apart in logs
        let short = self.0.get(..12).unwrap_or(&self.0);
        f.write_str(short)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("content {0} not found")]
    Missing(ContentRef),

    #[error("content {expected} is corrupt (digest {actual})")]
    Corrupt {
        expected: ContentRef,
        actual: ContentRef,
    },
}

/// "Given this reference, get these bytes"
pub trait ContentStore {
    /// Store `bytes`, returning their reference. Storing known content is a no-op.
    fn put(&mut self, bytes: &[u8]) -> Result<ContentRef, StoreError>;

    fn get(&self, content: &ContentRef) -> Result<Vec<u8>, StoreError>;

    fn contains(&self, content: &ContentRef) -> bool;
}

/// Blob store held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blobs: HashMap<ContentRef, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ContentStore for MemoryStore {
    fn put(&mut self, bytes: &[u8]) -> Result<ContentRef, StoreError> {
        let content = ContentRef::of(bytes);
        self.blobs
            .entry(content.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(content)
    }

    fn get(&self, content: &ContentRef) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(content)
            .cloned()
            .ok_or_else(|| StoreError::Missing(content.clone()))
    }

    fn contains(&self, content: &ContentRef) -> bool {
        self.blobs.contains_key(content)
    }
}

/// Blob store with one file per digest inside a directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (creating if needed) the blob directory at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Blob directory conventionally paired with a trace file: `<trace>.blobs`
    pub fn beside(trace_path: &Path) -> Result<Self, StoreError> {
        let mut name = trace_path.as_os_str().to_owned();
        name.push(".blobs");
        Self::open(PathBuf::from(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, content: &ContentRef) -> PathBuf {
        self.root.join(content.as_str())
    }
}

impl ContentStore for DirStore {
    fn put(&mut self, bytes: &[u8]) -> Result<ContentRef, StoreError> {
        let content = ContentRef::of(bytes);
        let path = self.path_for(&content);
        if !path.exists() {
            // Write-then-rename so a crash never leaves a truncated blob under its digest
            let tmp = path.with_extension("partial");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
            debug!("stored blob {} ({} bytes)", content, bytes.len());
        }
        Ok(content)
    }

    fn get(&self, content: &ContentRef) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(content);
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::Missing(content.clone()),
            _ => StoreError::Io(e),
        })?;
        let actual = ContentRef::of(&bytes);
        if &actual != content {
            return Err(StoreError::Corrupt {
                expected: content.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    fn contains(&self, content: &ContentRef) -> bool {
        self.path_for(content).exists()
    }
}
