//! Materializes layer blobs as directory trees under
//! `<dest_root>/<algorithm>/<hex>`.
//!
//! An existing destination directory is a complete prior extraction and is
//! reused as-is. Each layer is unpacked into a `.partial` sibling and renamed
//! into place only once it is complete, so an interrupted extraction never
//! masquerades as a cached one. Layers are never overlaid on each other here.

use crate::error::{Error, IoContext, Result};
use crate::tar_extractor::{self, Ownership};
use crate::BlobStore;
use log::{debug, info};
use oci_spec::image::Digest;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: Vec<Digest>,
    pub cached: Vec<Digest>,
}

/// Where the expanded tree for `digest` lives under `dest_root`.
pub fn expanded_path(dest_root: &Path, digest: &Digest) -> PathBuf {
    dest_root
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Extracts one layer unless it is already cached. Returns `true` when the
/// layer was unpacked by this call.
pub fn extract_layer(
    digest: &Digest,
    image_dir: &Path,
    dest_root: &Path,
    filter: Option<&HashSet<PathBuf>>,
    ownership: &Ownership,
) -> Result<bool> {
    let to = expanded_path(dest_root, digest);
    if to.exists() {
        debug!("Layer {} already extracted at {}", digest, to.display());
        return Ok(false);
    }

    let from = BlobStore::new(image_dir).resolve(digest);
    if !from.is_file() {
        return Err(Error::NotFound(format!("layer blob {}", from.display())));
    }

    let partial = partial_path(&to);
    if partial.exists() {
        fs::remove_dir_all(&partial)
            .io_context(|| format!("failed to clear {}", partial.display()))?;
    }
    fs::create_dir_all(&partial).io_context(|| format!("failed to create {}", partial.display()))?;

    tar_extractor::extract_tar(&from, &partial, filter, ownership)?;
    fs::rename(&partial, &to)
        .io_context(|| format!("failed to move {} into place", partial.display()))?;
    info!("Extracted layer {} to {}", digest, to.display());
    Ok(true)
}

/// Extracts each layer in order, skipping (and continuing past) layers whose
/// destination already exists.
pub fn extract_layers(
    digests: &[Digest],
    image_dir: &Path,
    dest_root: &Path,
    ownership: &Ownership,
) -> Result<ExtractReport> {
    extract_layers_with_progress(digests, image_dir, dest_root, ownership, |_, _, _| {})
}

/// Like [`extract_layers`], calling `progress(current, total, digest)` before
/// each layer. `current` starts at 1.
pub fn extract_layers_with_progress<F>(
    digests: &[Digest],
    image_dir: &Path,
    dest_root: &Path,
    ownership: &Ownership,
    mut progress: F,
) -> Result<ExtractReport>
where
    F: FnMut(usize, usize, &Digest),
{
    let mut report = ExtractReport::default();
    for (i, digest) in digests.iter().enumerate() {
        progress(i + 1, digests.len(), digest);
        if extract_layer(digest, image_dir, dest_root, None, ownership)? {
            report.extracted.push(digest.clone());
        } else {
            report.cached.push(digest.clone());
        }
    }
    Ok(report)
}
