//! Per-invocation build context.
//!
//! A [`BuildSession`] carries everything a build step needs to touch the
//! image: where the image and its expanded layers live, the build mode, the
//! ownership policy for extraction and whether this process currently holds
//! the image lock. Nothing here is process-global; each step constructs its
//! own session.

use crate::error::Result;
use crate::image::Image;
use crate::lock::DirLock;
use crate::tar_extractor::{Ownership, UidRange};
use log::debug;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONTEXT_DIR: &str = ".ocibuild";
pub const IMAGE_DIR: &str = "image";
pub const EXPANDED_DIR: &str = "expanded";
pub const LOCK_FILE: &str = "lock";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
    /// Layered OCI image; the only mode with a layer lifecycle.
    #[default]
    Oci,
    /// Single flattened rootfs.
    Flat,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub image_dir: PathBuf,
    pub expanded_dir: PathBuf,
    pub lock_path: PathBuf,
    pub mode: BuildMode,
    pub uid_range: UidRange,
}

impl SessionConfig {
    /// Standard layout under a build context directory.
    pub fn from_context<P: AsRef<Path>>(context_dir: P) -> Self {
        let context_dir = context_dir.as_ref();
        Self {
            image_dir: context_dir.join(IMAGE_DIR),
            expanded_dir: context_dir.join(EXPANDED_DIR),
            lock_path: context_dir.join(LOCK_FILE),
            mode: BuildMode::default(),
            uid_range: UidRange::blank(),
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug)]
pub struct BuildSession {
    config: SessionConfig,
    ownership: Ownership,
    lock: Option<DirLock>,
}

impl BuildSession {
    pub fn new(config: SessionConfig) -> Self {
        let ownership = Ownership::for_current_process(config.uid_range);
        Self {
            config,
            ownership,
            lock: None,
        }
    }

    /// Overrides the privilege-derived ownership policy.
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mode(&self) -> BuildMode {
        self.config.mode
    }

    pub fn image_dir(&self) -> &Path {
        &self.config.image_dir
    }

    pub fn expanded_dir(&self) -> &Path {
        &self.config.expanded_dir
    }

    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Runs `f` while holding the image lock. Nested calls reuse the lock
    /// already held. The lock is released before returning, also on error;
    /// an error from `f` takes precedence over a release failure.
    pub fn with_lock<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if self.lock.is_some() {
            return f(self);
        }

        self.lock = Some(DirLock::acquire(&self.config.lock_path)?);
        let result = f(self);
        let released = match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        };
        debug!("Image lock released");

        let value = result?;
        released?;
        Ok(value)
    }

    /// Reads the current image. Takes no lock.
    pub fn load_image(&self) -> Result<Image> {
        Image::load(&self.config.image_dir)
    }

    pub fn init_image(&mut self, ref_name: Option<&str>) -> Result<Image> {
        self.with_lock(|session| Image::init(&session.config.image_dir, ref_name))
    }

    /// Load, mutate and save the image under the lock.
    pub fn update_image<F>(&mut self, f: F) -> Result<Image>
    where
        F: FnOnce(&mut Image) -> Result<()>,
    {
        self.with_lock(|session| {
            let mut image = session.load_image()?;
            f(&mut image)?;
            image.save()?;
            Ok(image)
        })
    }
}
