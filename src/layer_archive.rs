//! Turns a layer working tree into a stored layer blob.
//!
//! Stack: tar -> HashingWriter(diff ID) -> gzip -> HashingWriter(blob) -> temp file.
//! Both digests come out of a single pass; the temp file is then renamed to
//! `blobs/sha256/<blob digest>`. Entries are archived in file-name order and
//! gzip carries no timestamp, so an unchanged tree yields the same digests.

use crate::blob_store::{sha256_digest, BlobStore};
use crate::error::{Error, IoContext, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tar_rs as tar;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    /// Digest of the stored (gzipped) blob.
    pub digest: Digest,
    /// Digest of the uncompressed tar stream.
    pub diff_id: Digest,
    pub size: u64,
}

pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub(crate) fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Appends every entry under `root` (not `root` itself) with paths relative
/// to it. Symlinks are archived as links.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, root: &Path) -> Result<()> {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry
            .map_err(io::Error::from)
            .io_context(|| format!("failed to walk {}", root.display()))?;
        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::Corrupt(format!("{} escaped {}", entry.path().display(), root.display())))?;

        let file_type = entry.file_type();
        if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
            log::warn!("Skipping special file {}", entry.path().display());
            continue;
        }

        builder
            .append_path_with_name(entry.path(), rel_path)
            .io_context(|| format!("failed to archive {}", entry.path().display()))?;
    }
    Ok(())
}

/// Archives `working_dir` and stores the result as a gzip layer blob.
/// A missing directory is archived as an empty layer.
pub fn archive_layer(working_dir: &Path, store: &BlobStore) -> Result<LayerBlob> {
    let tmp = store.temp_file()?;
    let file = tmp
        .reopen()
        .io_context(|| format!("failed to reopen {}", tmp.path().display()))?;

    let blob_hasher = HashingWriter::new(BufWriter::new(file));
    let encoder = GzEncoder::new(blob_hasher, Compression::default());
    let diff_hasher = HashingWriter::new(encoder);
    let mut builder = tar::Builder::new(diff_hasher);
    builder.follow_symlinks(false);

    if working_dir.exists() {
        append_tree(&mut builder, working_dir)?;
    }

    let diff_hasher = builder
        .into_inner()
        .io_context(|| "failed to finish layer tar stream")?;
    let (encoder, diff_hex) = diff_hasher.finish();
    let blob_hasher = encoder
        .finish()
        .io_context(|| "failed to finish layer compression")?;
    let (mut buf_writer, blob_hex) = blob_hasher.finish();
    buf_writer
        .flush()
        .io_context(|| format!("failed to flush {}", tmp.path().display()))?;
    drop(buf_writer);

    let size = tmp
        .as_file()
        .metadata()
        .io_context(|| format!("failed to stat {}", tmp.path().display()))?
        .len();
    let digest = store.commit_temp(tmp, &blob_hex)?;
    let diff_id = sha256_digest(&diff_hex)?;
    debug!(
        "Archived {} as {} (diff ID {}, {} bytes)",
        working_dir.display(),
        digest,
        diff_id,
        size
    );

    Ok(LayerBlob {
        digest,
        diff_id,
        size,
    })
}
