//! Content-addressed blob storage under `blobs/<algorithm>/<hex>`.
//!
//! Writes always land in a temporary file inside `blobs/` first and are then
//! renamed into place, so a reader never observes a half-written blob and
//! rewriting identical content is harmless. Removal is immediate; there is no
//! reference counting. Unreachable blobs are swept by
//! [`BlobStore::collect_garbage`].

use crate::error::{Error, IoContext, Result};
use log::{debug, trace, warn};
use oci_spec::image::Digest;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;

pub const BLOBS_DIR: &str = "blobs";
pub const SHA256: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcSummary {
    pub removed: usize,
    pub reclaimed_bytes: u64,
    pub kept: usize,
    /// Set when the sweep did not run because a root could not be walked.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    image_dir: PathBuf,
}

/// Builds a sha256 digest from a lowercase hex string.
pub fn sha256_digest(hex: &str) -> Result<Digest> {
    Ok(Digest::from_str(&format!("{}:{}", SHA256, hex))?)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(image_dir: P) -> Self {
        Self {
            image_dir: image_dir.as_ref().to_path_buf(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.image_dir.join(BLOBS_DIR)
    }

    /// Pure path arithmetic; performs no IO.
    pub fn resolve(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir()
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.resolve(digest).is_file()
    }

    /// Serializes `value` as compact JSON and stores it by content.
    pub fn write<T: Serialize>(&self, value: &T) -> Result<WrittenBlob> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::Corrupt(format!("failed to serialize blob: {}", e)))?;
        self.write_bytes(&bytes)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<WrittenBlob> {
        let hex = sha256_hex(bytes);
        let mut tmp = self.temp_file()?;
        tmp.write_all(bytes)
            .io_context(|| format!("failed to write temporary blob {}", tmp.path().display()))?;
        let digest = self.commit_temp(tmp, &hex)?;
        Ok(WrittenBlob {
            digest,
            size: bytes.len() as u64,
        })
    }

    /// A temporary file on the same filesystem as the blobs, for streaming
    /// writers that compute the digest while writing.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        let blobs_dir = self.blobs_dir();
        fs::create_dir_all(&blobs_dir)
            .io_context(|| format!("failed to create {}", blobs_dir.display()))?;
        tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&blobs_dir)
            .io_context(|| format!("failed to create temporary file in {}", blobs_dir.display()))
    }

    /// Moves a fully written temporary file to `blobs/sha256/<hex>`.
    pub fn commit_temp(&self, tmp: NamedTempFile, hex: &str) -> Result<Digest> {
        let digest = sha256_digest(hex)?;
        let dest = self.resolve(&digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("failed to create {}", parent.display()))?;
        }
        tmp.as_file()
            .sync_all()
            .io_context(|| format!("failed to sync {}", tmp.path().display()))?;
        tmp.persist(&dest)
            .map_err(|e| Error::io(format!("failed to store blob {}", dest.display()), e.error))?;
        debug!("Stored blob {}", digest);
        Ok(digest)
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.resolve(digest);
        fs::read(&path).map_err(|e| Error::at_path("read blob", &path, e))
    }

    /// Reads and parses a JSON blob. A missing blob is reported as corruption,
    /// since something on disk still references it.
    pub fn read_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let bytes = self.read(digest).map_err(|e| match e {
            Error::NotFound(msg) => Error::Corrupt(format!("referenced blob missing: {}", msg)),
            other => other,
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corrupt(format!("failed to parse blob {}: {}", digest, e)))
    }

    pub fn remove(&self, digest: &Digest) -> Result<()> {
        let path = self.resolve(digest);
        fs::remove_file(&path).map_err(|e| Error::at_path("remove blob", &path, e))?;
        debug!("Removed blob {}", digest);
        Ok(())
    }

    /// Every blob currently on disk, as `<algorithm>:<hex>` strings.
    pub fn list(&self) -> Result<Vec<String>> {
        let blobs_dir = self.blobs_dir();
        let mut found = Vec::new();
        if !blobs_dir.exists() {
            return Ok(found);
        }

        for algo_entry in
            fs::read_dir(&blobs_dir).io_context(|| format!("failed to list {}", blobs_dir.display()))?
        {
            let algo_entry = algo_entry.io_context(|| "failed to read blobs directory entry")?;
            if !algo_entry.path().is_dir() {
                continue;
            }
            let algorithm = algo_entry.file_name().to_string_lossy().to_string();
            for blob_entry in fs::read_dir(algo_entry.path())
                .io_context(|| format!("failed to list {}", algo_entry.path().display()))?
            {
                let blob_entry = blob_entry.io_context(|| "failed to read blob entry")?;
                if blob_entry.path().is_file() {
                    found.push(format!(
                        "{}:{}",
                        algorithm,
                        blob_entry.file_name().to_string_lossy()
                    ));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Deletes every blob whose `<algorithm>:<hex>` is not in `reachable`,
    /// plus stale temporary files left by interrupted writes. Running it twice
    /// is a no-op the second time.
    pub fn collect_garbage(&self, reachable: &HashSet<String>) -> Result<GcSummary> {
        let mut summary = GcSummary::default();

        for name in self.list()? {
            if reachable.contains(&name) {
                summary.kept += 1;
                continue;
            }
            let digest = match Digest::from_str(&name) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("Leaving unrecognized blob file {} in place: {}", name, e);
                    summary.kept += 1;
                    continue;
                }
            };
            let path = self.resolve(&digest);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match self.remove(&digest) {
                Ok(()) => {
                    summary.removed += 1;
                    summary.reclaimed_bytes += size;
                }
                // Raced with another sweep.
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let blobs_dir = self.blobs_dir();
        if blobs_dir.exists() {
            for entry in fs::read_dir(&blobs_dir)
                .io_context(|| format!("failed to list {}", blobs_dir.display()))?
            {
                let entry = entry.io_context(|| "failed to read blobs directory entry")?;
                let file_name = entry.file_name();
                if entry.path().is_file() && file_name.to_string_lossy().starts_with(".tmp-") {
                    trace!("Removing stale temporary blob {}", entry.path().display());
                    fs::remove_file(entry.path()).ok();
                }
            }
        }

        debug!(
            "Garbage collection removed {} blobs ({} bytes), kept {}",
            summary.removed, summary.reclaimed_bytes, summary.kept
        );
        Ok(summary)
    }
}
