//! Top-layer lifecycle across build steps.
//!
//! The top layer's working tree lives at `expanded/<algorithm>/<hex>`, keyed
//! by the digest of the blob it was last committed as. A sibling
//! `<hex>.dirty` marker records that the tree may have diverged from that
//! blob:
//!
//! - Clean: tree matches the committed blob, no marker.
//! - Dirty: marker present; the next rehash archives the tree and replaces
//!   the top layer.
//! - New: only the `new-layer` scratch area exists, nothing committed yet.
//!
//! After a commit the tree is renamed to its new digest, so the following
//! step finds it without re-extracting.

use crate::blob_store::SHA256;
use crate::error::{Error, IoContext, Result};
use crate::extract::{self, expanded_path, ExtractReport};
use crate::image::Image;
use crate::layer_archive::archive_layer;
use crate::session::{BuildMode, BuildSession};
use log::{debug, info, warn};
use oci_spec::image::Digest;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const NEW_LAYER_DIR: &str = "new-layer";
pub const DIRTY_SUFFIX: &str = ".dirty";

pub fn dirty_marker_path(layer_dir: &Path) -> PathBuf {
    let mut name = layer_dir.as_os_str().to_os_string();
    name.push(DIRTY_SUFFIX);
    PathBuf::from(name)
}

/// Flags `layer_dir` as diverged from its committed blob. The scratch area is
/// never marked; it has no committed blob to diverge from.
pub fn mark_dirty(layer_dir: &Path) -> Result<()> {
    if layer_dir.file_name().is_some_and(|n| n == NEW_LAYER_DIR) {
        return Ok(());
    }
    let marker = dirty_marker_path(layer_dir);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent).io_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&marker, b"").io_context(|| format!("failed to write {}", marker.display()))?;
    debug!("Marked {} dirty", layer_dir.display());
    Ok(())
}

pub fn is_dirty(layer_dir: &Path) -> bool {
    match fs::symlink_metadata(dirty_marker_path(layer_dir)) {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        // Unknown state: assume dirty so the content gets rehashed
        Err(_) => true,
    }
}

impl BuildSession {
    fn require_layered(&self, action: &str) -> Result<()> {
        match self.mode() {
            BuildMode::Oci => Ok(()),
            mode => Err(Error::ModeMismatch(format!(
                "{} requires a layered OCI build, session is {:?}",
                action, mode
            ))),
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.expanded_dir().join(SHA256).join(NEW_LAYER_DIR)
    }

    pub fn layer_dir(&self, digest: &Digest) -> PathBuf {
        expanded_path(self.expanded_dir(), digest)
    }

    /// Ensures the top layer's working tree is on disk and returns it. With no
    /// layers yet, this is the scratch area.
    pub fn expand_top_layer(&mut self) -> Result<PathBuf> {
        self.require_layered("expanding the top layer")?;
        self.with_lock(|session| {
            let image = session.load_image()?;
            match image.top_layer_digest() {
                Some(digest) => {
                    extract::extract_layer(
                        &digest,
                        session.image_dir(),
                        session.expanded_dir(),
                        None,
                        session.ownership(),
                    )?;
                    Ok(session.layer_dir(&digest))
                }
                None => {
                    let scratch = session.scratch_dir();
                    fs::create_dir_all(&scratch)
                        .io_context(|| format!("failed to create {}", scratch.display()))?;
                    Ok(scratch)
                }
            }
        })
    }

    /// Expands the top layer and marks it dirty; use before writing into it.
    pub fn open_top_layer(&mut self) -> Result<PathBuf> {
        self.with_lock(|session| {
            let dir = session.expand_top_layer()?;
            mark_dirty(&dir)?;
            Ok(dir)
        })
    }

    /// Extracts every layer of the image, lowest first, reporting each one to
    /// `progress` as `(current, total, digest)`.
    pub fn expand_all_layers<F>(&mut self, progress: F) -> Result<ExtractReport>
    where
        F: FnMut(usize, usize, &Digest),
    {
        self.with_lock(|session| {
            let image = session.load_image()?;
            extract::extract_layers_with_progress(
                &image.layer_digests(),
                session.image_dir(),
                session.expanded_dir(),
                session.ownership(),
                progress,
            )
        })
    }

    /// Archives `working` into a layer blob, registers it (replacing the top
    /// layer or appending a new one) and moves the tree to its new digest.
    fn commit_working_tree(
        &self,
        image: &mut Image,
        working: &Path,
        replace_top: bool,
    ) -> Result<Digest> {
        let layer = archive_layer(working, image.store())?;
        if replace_top {
            let old = image.update_top_layer(&layer.digest, &layer.diff_id, layer.size)?;
            debug!(
                "Top layer {} replaced by {}",
                old.map(|d| d.to_string()).unwrap_or_else(|| "<none>".to_string()),
                layer.digest
            );
        } else {
            image.new_top_layer(&layer.digest, &layer.diff_id, layer.size)?;
        }

        let target = self.layer_dir(&layer.digest);
        if target != working && working.exists() {
            if target.exists() {
                // Identical content is already expanded
                fs::remove_dir_all(working)
                    .io_context(|| format!("failed to remove {}", working.display()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .io_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::rename(working, &target).io_context(|| {
                    format!("failed to move {} to {}", working.display(), target.display())
                })?;
            }
        }
        Ok(layer.digest)
    }

    /// Commits the top layer's working tree if it is dirty. Returns whether a
    /// new blob was produced; a clean or absent tree is nothing to do.
    pub fn rehash_top_layer(&mut self) -> Result<bool> {
        self.require_layered("rehashing the top layer")?;
        self.with_lock(|session| {
            let mut image = session.load_image()?;

            let (working, marker) = match image.top_layer_digest() {
                Some(digest) => {
                    let working = session.layer_dir(&digest);
                    if !is_dirty(&working) {
                        debug!("Top layer {} is clean", digest);
                        return Ok(false);
                    }
                    let marker = dirty_marker_path(&working);
                    if !working.exists() {
                        debug!("Dirty marker without working tree for {}, dropping it", digest);
                        fs::remove_file(&marker).ok();
                        return Ok(false);
                    }
                    (working, Some(marker))
                }
                None => {
                    let scratch = session.scratch_dir();
                    if !scratch.exists() {
                        return Ok(false);
                    }
                    (scratch, None)
                }
            };

            let digest = session.commit_working_tree(&mut image, &working, true)?;
            if let Some(marker) = marker {
                fs::remove_file(&marker).map_err(|e| {
                    Error::io(format!("could not remove dirty marker {}", marker.display()), e)
                })?;
            }
            image.collect_garbage()?;
            info!("Rehashed top layer as {}", digest);
            Ok(true)
        })
    }

    fn reset_scratch_dir(&self) -> Result<PathBuf> {
        let scratch = self.scratch_dir();
        if scratch.exists() {
            fs::remove_dir_all(&scratch)
                .io_context(|| format!("failed to clear {}", scratch.display()))?;
        }
        fs::create_dir_all(&scratch).io_context(|| format!("failed to create {}", scratch.display()))?;
        Ok(scratch)
    }

    /// Freezes the current top layer and starts an empty one on top of it.
    ///
    /// Finalizing the previous top layer is best effort: a failure there is
    /// logged and the new layer is still created.
    pub fn new_layer(&mut self) -> Result<Digest> {
        self.with_lock(|session| {
            session.require_layered("adding layers")?;

            if let Err(e) = session.rehash_top_layer() {
                warn!("Failed to finalize previous top layer: {}", e);
            }

            let scratch = session.reset_scratch_dir()?;
            let mut image = session.load_image()?;
            let digest = session.commit_working_tree(&mut image, &scratch, false)?;
            image.collect_garbage()?;
            info!(
                "Started layer {} ({} layers total)",
                digest,
                image.manifest().layers().len()
            );
            Ok(digest)
        })
    }
}
