//! Locating the active manifest of an image directory.
//!
//! Two on-disk layouts are accepted on read:
//! - legacy: `refs/<name>` holding a bare manifest descriptor,
//! - current: `index.json` whose entries carry the ref name as the
//!   `org.opencontainers.image.ref.name` annotation.
//!
//! The layout is resolved once at load time. Commits always write
//! `index.json`, through a temporary file renamed over the old one.

use crate::blob_store::WrittenBlob;
use crate::error::{Error, IoContext, Result};
use log::debug;
use oci_spec::image::{
    Arch, Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType, Os,
    PlatformBuilder,
};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const INDEX_FILE: &str = "index.json";
pub const REFS_DIR: &str = "refs";
pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const INDEX_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone)]
pub enum PointerLayout {
    /// `refs/<name>`
    LegacyRef(String),
    /// `index.json`, with the position of the selected manifest entry.
    Index { index: ImageIndex, position: usize },
}

#[derive(Debug, Clone)]
pub struct Pointer {
    layout: PointerLayout,
    descriptor: Descriptor,
    ref_name: Option<String>,
}

fn is_manifest(descriptor: &Descriptor) -> bool {
    descriptor.media_type() == &MediaType::ImageManifest
}

fn ref_name_of(descriptor: &Descriptor) -> Option<String> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REF_NAME))
        .filter(|name| !name.is_empty())
        .cloned()
}

fn read_index(path: &Path) -> Result<ImageIndex> {
    let bytes = fs::read(path).map_err(|e| Error::at_path("read", path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Corrupt(format!("failed to parse {}: {}", path.display(), e)))
}

/// Legacy ref files, sorted by name so resolution is deterministic.
fn read_legacy_refs(image_dir: &Path) -> Result<Vec<(String, Descriptor)>> {
    let refs_dir = image_dir.join(REFS_DIR);
    if !refs_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(&refs_dir).io_context(|| format!("failed to list {}", refs_dir.display()))? {
        let entry = entry.io_context(|| "failed to read refs entry")?;
        if entry.path().is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();

    let mut refs = Vec::with_capacity(names.len());
    for name in names {
        let path = refs_dir.join(&name);
        let bytes = fs::read(&path).map_err(|e| Error::at_path("read", &path, e))?;
        let descriptor: Descriptor = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corrupt(format!("failed to parse ref {}: {}", path.display(), e)))?;
        refs.push((name, descriptor));
    }
    Ok(refs)
}

/// Writes `bytes` to `dest` through a sibling temporary file and a rename.
pub(crate) fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::NotFound(format!("no parent directory for {}", dest.display())))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .io_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .io_context(|| format!("failed to write {}", tmp.path().display()))?;
    tmp.as_file()
        .sync_all()
        .io_context(|| format!("failed to sync {}", tmp.path().display()))?;
    tmp.persist(dest)
        .map_err(|e| Error::io(format!("failed to replace {}", dest.display()), e.error))?;
    Ok(())
}

impl Pointer {
    /// Picks the first manifest-typed entry, preferring `index.json` over
    /// legacy refs.
    pub fn resolve(image_dir: &Path) -> Result<Self> {
        let index_path = image_dir.join(INDEX_FILE);
        if index_path.exists() {
            let index = read_index(&index_path)?;
            if let Some(position) = index.manifests().iter().position(is_manifest) {
                let descriptor = index.manifests()[position].clone();
                let ref_name = ref_name_of(&descriptor);
                debug!(
                    "Resolved manifest {} from {} (ref: {:?})",
                    descriptor.digest(),
                    INDEX_FILE,
                    ref_name
                );
                return Ok(Self {
                    layout: PointerLayout::Index { index, position },
                    descriptor,
                    ref_name,
                });
            }
        }

        for (name, descriptor) in read_legacy_refs(image_dir)? {
            if is_manifest(&descriptor) {
                debug!("Resolved manifest {} from legacy ref {}", descriptor.digest(), name);
                return Ok(Self {
                    layout: PointerLayout::LegacyRef(name.clone()),
                    descriptor,
                    ref_name: Some(name),
                });
            }
        }

        Err(Error::NotFound(format!(
            "no manifests found in image {}",
            image_dir.display()
        )))
    }

    /// A pointer for a brand-new image; nothing is on disk until [`Pointer::commit`].
    pub fn fresh(descriptor: Descriptor, ref_name: Option<String>) -> Result<Self> {
        let index = ImageIndexBuilder::default()
            .schema_version(INDEX_SCHEMA_VERSION)
            .manifests(Vec::<Descriptor>::new())
            .build()?;
        Ok(Self {
            layout: PointerLayout::Index { index, position: 0 },
            descriptor,
            ref_name,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.ref_name.as_deref()
    }

    pub fn layout(&self) -> &PointerLayout {
        &self.layout
    }

    /// Points the image at a newly written manifest blob and persists the
    /// pointer as `index.json`. Other index entries are kept; a legacy
    /// ref is appended after whatever `index.json` already holds.
    pub fn commit(&mut self, image_dir: &Path, manifest: &WrittenBlob) -> Result<()> {
        let mut annotations: HashMap<String, String> = match &self.layout {
            PointerLayout::Index { .. } => self.descriptor.annotations().clone().unwrap_or_default(),
            PointerLayout::LegacyRef(_) => HashMap::new(),
        };
        annotations.remove(ANNOTATION_REF_NAME);
        if let Some(name) = &self.ref_name {
            annotations.insert(ANNOTATION_REF_NAME.to_string(), name.clone());
        }

        let platform = PlatformBuilder::default()
            .architecture(Arch::default())
            .os(Os::default())
            .build()?;

        let mut builder = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(manifest.digest.clone())
            .size(manifest.size)
            .platform(platform);
        if !annotations.is_empty() {
            builder = builder.annotations(annotations);
        }
        let descriptor = builder.build()?;

        let index_path = image_dir.join(INDEX_FILE);
        let (mut manifests, position) = match &self.layout {
            PointerLayout::Index { index, position } => (index.manifests().clone(), *position),
            // An index without manifest entries may still root other content
            PointerLayout::LegacyRef(_) if index_path.exists() => {
                let existing = read_index(&index_path)?.manifests().clone();
                let position = existing.len();
                (existing, position)
            }
            PointerLayout::LegacyRef(_) => (Vec::new(), 0),
        };
        if position < manifests.len() {
            manifests[position] = descriptor.clone();
        } else {
            manifests.push(descriptor.clone());
        }
        let position = position.min(manifests.len() - 1);

        let index = ImageIndexBuilder::default()
            .schema_version(INDEX_SCHEMA_VERSION)
            .manifests(manifests)
            .build()?;
        let bytes = serde_json::to_vec(&index)
            .map_err(|e| Error::Corrupt(format!("failed to serialize index: {}", e)))?;

        write_atomically(&index_path, &bytes)?;
        debug!("Committed {} -> {}", INDEX_FILE, descriptor.digest());

        self.descriptor = descriptor;
        self.layout = PointerLayout::Index { index, position };
        Ok(())
    }

    /// Every descriptor an image directory roots: all `index.json` entries
    /// plus all legacy refs.
    pub fn roots(image_dir: &Path) -> Result<Vec<Descriptor>> {
        let mut roots = Vec::new();
        let index_path = image_dir.join(INDEX_FILE);
        if index_path.exists() {
            roots.extend(read_index(&index_path)?.manifests().iter().cloned());
        }
        roots.extend(read_legacy_refs(image_dir)?.into_iter().map(|(_, d)| d));
        Ok(roots)
    }
}
