//! The live, mutable projection of one on-disk OCI image.
//!
//! [`Image`] holds the manifest, the config and the pointer (ref or index
//! entry) for a single image directory. Mutations happen in memory; nothing
//! reaches disk until [`Image::save`], which:
//! 1. writes the config as a new blob and points the manifest at it,
//! 2. writes the manifest as a new blob,
//! 3. commits the pointer by atomically replacing `index.json`.
//!
//! The previous config and manifest blobs are left in place; they become
//! unreachable and are removed by [`Image::collect_garbage`]. A crash at any
//! point therefore leaves either the old or the new image readable.
//!
//! Layer bookkeeping keeps `rootfs.diff_ids` and `manifest.layers` the same
//! length and order. Only the last entry (the top layer) is ever rewritten.

use crate::blob_store::{BlobStore, GcSummary, WrittenBlob};
use crate::error::{Error, IoContext, Result};
use crate::pointer::{Pointer, PointerLayout, OCI_LAYOUT_FILE};
use log::{debug, info, warn};
use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, DescriptorBuilder, Digest, ImageConfiguration,
    ImageConfigurationBuilder, ImageIndex, ImageManifest, ImageManifestBuilder, MediaType, Os,
    RootFsBuilder,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

pub const MANIFEST_SCHEMA_VERSION: u32 = 2;
pub const ROOTFS_TYPE: &str = "layers";

#[derive(Debug)]
pub struct Image {
    store: BlobStore,
    pointer: Pointer,
    config: ImageConfiguration,
    manifest: ImageManifest,
}

fn layer_descriptor(layer_digest: &Digest, size: u64) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::ImageLayerGzip)
        .digest(layer_digest.clone())
        .size(size)
        .build()?)
}

impl Image {
    /// Creates an empty image layout (no layers) at `image_dir` and commits it.
    pub fn init<P: AsRef<Path>>(image_dir: P, ref_name: Option<&str>) -> Result<Self> {
        let image_dir = image_dir.as_ref();
        let store = BlobStore::new(image_dir);
        fs::create_dir_all(store.blobs_dir())
            .io_context(|| format!("failed to create {}", store.blobs_dir().display()))?;
        fs::write(
            image_dir.join(OCI_LAYOUT_FILE),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )
        .io_context(|| format!("failed to write {}", OCI_LAYOUT_FILE))?;

        let rootfs = RootFsBuilder::default()
            .typ(ROOTFS_TYPE)
            .diff_ids(Vec::<String>::new())
            .build()?;
        let config = ImageConfigurationBuilder::default()
            .architecture(Arch::default())
            .os(Os::default())
            .rootfs(rootfs)
            .config(ConfigBuilder::default().build()?)
            .build()?;

        let config_blob = store.write(&config)?;
        let config_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_blob.digest.clone())
            .size(config_blob.size)
            .build()?;
        let manifest = ImageManifestBuilder::default()
            .schema_version(MANIFEST_SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(Vec::<Descriptor>::new())
            .build()?;

        let manifest_blob = store.write(&manifest)?;
        let pointer_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(manifest_blob.digest.clone())
            .size(manifest_blob.size)
            .build()?;
        let mut pointer = Pointer::fresh(pointer_descriptor, ref_name.map(str::to_string))?;
        pointer.commit(image_dir, &manifest_blob)?;
        info!("Initialized empty image at {}", image_dir.display());

        Ok(Self {
            store,
            pointer,
            config,
            manifest,
        })
    }

    /// Resolves the pointer in either layout, then reads the manifest and the
    /// config it names.
    pub fn load<P: AsRef<Path>>(image_dir: P) -> Result<Self> {
        let image_dir = image_dir.as_ref();
        let store = BlobStore::new(image_dir);
        let pointer = Pointer::resolve(image_dir)?;
        let manifest: ImageManifest = store.read_json(pointer.descriptor().digest())?;
        let config: ImageConfiguration = store.read_json(manifest.config().digest())?;
        debug!(
            "Loaded image {} with {} layers",
            pointer.descriptor().digest(),
            manifest.layers().len()
        );

        Ok(Self {
            store,
            pointer,
            config,
            manifest,
        })
    }

    /// Persists config, manifest and pointer. Fails fast; old blobs are not
    /// touched here.
    pub fn save(&mut self) -> Result<()> {
        let diff_ids = self.config.rootfs().diff_ids().len();
        let layers = self.manifest.layers().len();
        if diff_ids != layers {
            return Err(Error::Corrupt(format!(
                "refusing to save: {} diff IDs but {} layer descriptors",
                diff_ids, layers
            )));
        }

        let WrittenBlob { digest, size } = self.store.write(&self.config)?;
        let mut config_descriptor = self.manifest.config().clone();
        config_descriptor.set_digest(digest);
        config_descriptor.set_size(size);
        self.manifest.set_config(config_descriptor);

        let manifest_blob = self.store.write(&self.manifest)?;
        self.pointer.commit(self.store.image_dir(), &manifest_blob)?;
        debug!("Saved image, manifest is now {}", manifest_blob.digest);
        Ok(())
    }

    pub fn image_dir(&self) -> &Path {
        self.store.image_dir()
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn pointer(&self) -> &Descriptor {
        self.pointer.descriptor()
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.pointer.ref_name()
    }

    /// The layout the pointer was resolved from, or `Index` once saved.
    pub fn layout(&self) -> &PointerLayout {
        self.pointer.layout()
    }

    pub fn diff_ids(&self) -> &[String] {
        self.config.rootfs().diff_ids()
    }

    pub fn layer_digests(&self) -> Vec<Digest> {
        self.manifest
            .layers()
            .iter()
            .map(|layer| layer.digest().clone())
            .collect()
    }

    pub fn top_layer_digest(&self) -> Option<Digest> {
        self.manifest.layers().last().map(|layer| layer.digest().clone())
    }

    fn set_diff_ids(&mut self, diff_ids: Vec<String>) -> Result<()> {
        let rootfs = RootFsBuilder::default()
            .typ(ROOTFS_TYPE)
            .diff_ids(diff_ids)
            .build()?;
        self.config.set_rootfs(rootfs);
        Ok(())
    }

    /// Replaces the top layer (or creates it when the image has none) and
    /// saves. Returns the digest previously in the top slot so the caller can
    /// drop the orphaned blob; `None` when there was no layer yet.
    pub fn update_top_layer(
        &mut self,
        layer_digest: &Digest,
        diff_id: &Digest,
        size: u64,
    ) -> Result<Option<Digest>> {
        let mut diff_ids = self.diff_ids().to_vec();
        match diff_ids.last_mut() {
            Some(last) => *last = diff_id.to_string(),
            None => diff_ids.push(diff_id.to_string()),
        }
        self.set_diff_ids(diff_ids)?;

        let descriptor = layer_descriptor(layer_digest, size)?;
        let mut layers = self.manifest.layers().clone();
        let old = match layers.last_mut() {
            Some(last) => Some(std::mem::replace(last, descriptor).digest().clone()),
            None => {
                layers.push(descriptor);
                None
            }
        };
        self.manifest.set_layers(layers);

        self.save()?;
        Ok(old)
    }

    /// Appends a new top layer and saves.
    pub fn new_top_layer(&mut self, layer_digest: &Digest, diff_id: &Digest, size: u64) -> Result<()> {
        let mut diff_ids = self.diff_ids().to_vec();
        diff_ids.push(diff_id.to_string());
        self.set_diff_ids(diff_ids)?;

        let mut layers = self.manifest.layers().clone();
        layers.push(layer_descriptor(layer_digest, size)?);
        self.manifest.set_layers(layers);

        self.save()
    }

    /// Writes the manifest (or the config) as JSON plus a trailing newline.
    pub fn print<W: Write>(&self, w: &mut W, pretty: bool, print_config: bool) -> Result<()> {
        let mut blob = if print_config {
            to_json(&self.config, pretty)?
        } else {
            to_json(&self.manifest, pretty)?
        };
        blob.push(b'\n');

        let n = w.write(&blob).io_context(|| "failed to print image")?;
        if n < blob.len() {
            return Err(Error::io(
                "failed to print image",
                std::io::Error::from(std::io::ErrorKind::WriteZero),
            ));
        }
        Ok(())
    }

    fn runtime_config(&self) -> Result<oci_spec::image::Config> {
        match self.config.config() {
            Some(config) => Ok(config.clone()),
            None => Ok(ConfigBuilder::default().build()?),
        }
    }

    /// Sets `key=value` in the environment, replacing an existing entry.
    pub fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        let mut config = self.runtime_config()?;
        let mut env = config.env().clone().unwrap_or_default();
        let prefix = format!("{}=", key);
        let entry = format!("{}{}", prefix, value);
        match env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
        config.set_env(Some(env));
        self.config.set_config(Some(config));
        Ok(())
    }

    pub fn remove_env(&mut self, key: &str) -> Result<()> {
        let mut config = self.runtime_config()?;
        let mut env = config.env().clone().unwrap_or_default();
        let prefix = format!("{}=", key);
        let before = env.len();
        env.retain(|e| !e.starts_with(&prefix));
        if env.len() == before {
            return Err(Error::NotFound(format!("environment variable {}", key)));
        }
        config.set_env(if env.is_empty() { None } else { Some(env) });
        self.config.set_config(Some(config));
        Ok(())
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) -> Result<()> {
        let mut config = self.runtime_config()?;
        config.set_entrypoint(if entrypoint.is_empty() {
            None
        } else {
            Some(entrypoint)
        });
        self.config.set_config(Some(config));
        Ok(())
    }

    pub fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        let mut config = self.runtime_config()?;
        config.set_working_dir(Some(dir.to_string()));
        self.config.set_config(Some(config));
        Ok(())
    }

    pub fn add_label(&mut self, key: &str, value: &str) -> Result<()> {
        let mut config = self.runtime_config()?;
        let mut labels: HashMap<String, String> = config.labels().clone().unwrap_or_default();
        labels.insert(key.to_string(), value.to_string());
        config.set_labels(Some(labels));
        self.config.set_config(Some(config));
        Ok(())
    }

    pub fn remove_label(&mut self, key: &str) -> Result<()> {
        let mut config = self.runtime_config()?;
        let mut labels: HashMap<String, String> = config.labels().clone().unwrap_or_default();
        if labels.remove(key).is_none() {
            return Err(Error::NotFound(format!("label {}", key)));
        }
        config.set_labels(if labels.is_empty() { None } else { Some(labels) });
        self.config.set_config(Some(config));
        Ok(())
    }

    /// Blobs reachable from every root of the image directory: index entries
    /// and legacy refs, then through nested indexes down to each manifest's
    /// config, layers and subject. `None` when some root or index child has a
    /// media type that cannot be walked; nothing is safe to delete then.
    pub fn reachable_blobs(image_dir: &Path) -> Result<Option<HashSet<String>>> {
        let store = BlobStore::new(image_dir);
        let mut reachable = HashSet::new();
        let mut pending = Pointer::roots(image_dir)?;

        while let Some(descriptor) = pending.pop() {
            if !reachable.insert(descriptor.digest().to_string()) {
                continue;
            }
            let kind = node_kind(descriptor.media_type());
            if kind == NodeKind::Unknown {
                warn!(
                    "Cannot walk {} ({}), treating every blob as reachable",
                    descriptor.digest(),
                    descriptor.media_type()
                );
                return Ok(None);
            }
            if !store.exists(descriptor.digest()) {
                continue;
            }
            match kind {
                NodeKind::Manifest => {
                    let manifest: ImageManifest = store.read_json(descriptor.digest())?;
                    reachable.insert(manifest.config().digest().to_string());
                    for layer in manifest.layers() {
                        reachable.insert(layer.digest().to_string());
                    }
                    if let Some(subject) = manifest.subject() {
                        pending.push(subject.clone());
                    }
                }
                NodeKind::Index => {
                    let index: ImageIndex = store.read_json(descriptor.digest())?;
                    pending.extend(index.manifests().iter().cloned());
                }
                NodeKind::Unknown => {}
            }
        }
        Ok(Some(reachable))
    }

    /// Removes every blob no longer reachable from the image's roots. Skips
    /// the sweep when reachability cannot be fully determined.
    pub fn collect_garbage(&self) -> Result<GcSummary> {
        match Self::reachable_blobs(self.image_dir())? {
            Some(reachable) => self.store.collect_garbage(&reachable),
            None => Ok(GcSummary {
                skipped: true,
                ..GcSummary::default()
            }),
        }
    }
}

const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Manifest,
    Index,
    Unknown,
}

fn node_kind(media_type: &MediaType) -> NodeKind {
    match media_type {
        MediaType::ImageManifest => NodeKind::Manifest,
        MediaType::ImageIndex => NodeKind::Index,
        other => match other.to_string().as_str() {
            DOCKER_MANIFEST_V2 => NodeKind::Manifest,
            DOCKER_MANIFEST_LIST_V2 => NodeKind::Index,
            _ => NodeKind::Unknown,
        },
    }
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<Vec<u8>> {
    let result = if pretty {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        value.serialize(&mut serializer).map(|_| buf)
    } else {
        serde_json::to_vec(value)
    };
    result.map_err(|e| Error::Corrupt(format!("failed to serialize: {}", e)))
}

/// Parses `<algorithm>:<hex>`.
pub fn parse_digest(value: &str) -> Result<Digest> {
    Ok(Digest::from_str(value)?)
}
