//! Object storage for encrypted message payloads.
//!
//! The relay offloads ciphertext bodies to an object store keyed
//! `messages/{message_id}.bin`, keeping only metadata rows in SQLite. The
//! store engine itself is a collaborator; [`BlobStore`] is the seam and
//! [`FsBlobStore`] the local-filesystem implementation used by the server
//! and tests. Keys use a two-level directory prefix to avoid large flat
//! directories.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum BlobError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::Io(e) => write!(f, "io error: {e}"),
            BlobError::Serde(e) => write!(f, "metadata error: {e}"),
            BlobError::NotFound(key) => write!(f, "blob not found: {key}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e)
    }
}

impl From<serde_json::Error> for BlobError {
    fn from(e: serde_json::Error) -> Self {
        BlobError::Serde(e)
    }
}

/// Custom metadata attached to every stored message blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMetadata {
    pub message_id: String,
    pub receipt_cid: String,
    pub sender_did: String,
    pub uploaded_at: i64,
}

/// Object-store seam: raw bytes plus per-object custom metadata.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], metadata: &BlobMetadata) -> Result<(), BlobError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;
    fn metadata(&self, key: &str) -> Result<BlobMetadata, BlobError>;
    fn delete(&self, key: &str) -> Result<(), BlobError>;
    fn exists(&self, key: &str) -> Result<bool, BlobError>;
    /// All keys under a prefix, for the orphan sweep.
    fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError>;
}

/// The object-store key for a message body.
pub fn message_blob_key(message_id: &str) -> String {
    format!("messages/{message_id}.bin")
}

/// Filesystem-backed blob store rooted at a directory.
///
/// Each object is a file under `{root}/{prefix}/{key}` with a `.meta.json`
/// sidecar carrying the custom metadata.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: &Path) -> Result<Self, BlobError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Derive the on-disk path for a key, fanning the basename out over a
    /// two-level prefix (`name[0..2] / name[2..4]`).
    fn blob_path(&self, key: &str) -> PathBuf {
        let (dir, name) = match key.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", key),
        };
        let (d1, d2) = if name.len() >= 4 {
            (&name[..2], &name[2..4])
        } else {
            (&name[..name.len().min(2)], "xx")
        };
        self.root.join(dir).join(d1).join(d2).join(name)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = self.blob_path(key).into_os_string();
        path.push(".meta.json");
        PathBuf::from(path)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8], metadata: &BlobMetadata) -> Result<(), BlobError> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        fs::write(self.meta_path(key), serde_json::to_vec(metadata)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => {}
            // Idempotent: deleting an absent blob is a no-op.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BlobError::Io(e)),
        }
        match fs::remove_file(self.meta_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    fn metadata(&self, key: &str) -> Result<BlobMetadata, BlobError> {
        match fs::read(self.meta_path(key)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.blob_path(key).exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let root = self.root.join(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for d1 in fs::read_dir(&root)? {
            let d1 = d1?.path();
            if !d1.is_dir() {
                continue;
            }
            for d2 in fs::read_dir(&d1)? {
                let d2 = d2?.path();
                if !d2.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&d2)? {
                    let path = entry?.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if path.is_file() && !name.ends_with(".meta.json") {
                        keys.push(format!("{prefix}/{name}"));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
