//! Image load/save behaviour against the on-disk layout.

use ocibuild::blob_store::sha256_digest;
use ocibuild::pointer::{INDEX_FILE, REFS_DIR};
use ocibuild::{BlobStore, ErrorKind, Image, PointerLayout};
use oci_spec::image::{Digest, ImageIndex, ImageManifest};
use std::fs;
use tempfile::tempdir;

fn digest(c: &str) -> Digest {
    sha256_digest(&c.repeat(64)).unwrap()
}

#[test]
fn test_save_then_load_round_trips() {
    let temp_dir = tempdir().unwrap();
    let mut image = Image::init(temp_dir.path(), Some("base")).unwrap();
    image.new_top_layer(&digest("1"), &digest("2"), 42).unwrap();
    image.set_env("PATH", "/usr/bin:/bin").unwrap();
    image.add_label("stage", "test").unwrap();
    image.save().unwrap();

    let loaded = Image::load(temp_dir.path()).unwrap();
    assert_eq!(loaded.ref_name(), Some("base"));
    assert_eq!(loaded.manifest(), image.manifest());
    assert_eq!(loaded.config(), image.config());
    assert_eq!(loaded.pointer().digest(), image.pointer().digest());

    // Saving an unchanged image produces the same content addresses
    let mut again = Image::load(temp_dir.path()).unwrap();
    again.save().unwrap();
    assert_eq!(again.pointer().digest(), loaded.pointer().digest());
}

#[test]
fn test_layer_counts_stay_aligned() {
    let temp_dir = tempdir().unwrap();
    let mut image = Image::init(temp_dir.path(), None).unwrap();

    image.new_top_layer(&digest("a"), &digest("b"), 1).unwrap();
    assert_eq!(image.layer_digests().len(), 1);
    assert_eq!(image.diff_ids().len(), 1);

    image.new_top_layer(&digest("c"), &digest("d"), 2).unwrap();
    assert_eq!(image.layer_digests().len(), 2);

    let old = image.update_top_layer(&digest("e"), &digest("f"), 3).unwrap();
    assert_eq!(old, Some(digest("c")));
    assert_eq!(image.layer_digests(), vec![digest("a"), digest("e")]);
    assert_eq!(
        image.diff_ids(),
        &[digest("b").to_string(), digest("f").to_string()]
    );

    let reloaded = Image::load(temp_dir.path()).unwrap();
    assert_eq!(reloaded.layer_digests().len(), reloaded.diff_ids().len());
}

#[test]
fn test_new_top_layer_on_single_layer_image() {
    let temp_dir = tempdir().unwrap();
    let mut image = Image::init(temp_dir.path(), None).unwrap();
    assert_eq!(image.update_top_layer(&digest("a"), &digest("b"), 1).unwrap(), None);

    image.new_top_layer(&digest("c"), &digest("d"), 2).unwrap();
    assert_eq!(image.top_layer_digest(), Some(digest("c")));
    assert_eq!(image.layer_digests()[0], digest("a"));

    let reloaded = Image::load(temp_dir.path()).unwrap();
    assert_eq!(reloaded.layer_digests(), vec![digest("a"), digest("c")]);
}

#[test]
fn test_save_refuses_misaligned_layers() {
    let temp_dir = tempdir().unwrap();
    let image = Image::init(temp_dir.path(), None).unwrap();

    // Hand-craft a manifest with a layer the config does not know about
    let mut manifest = image.manifest().clone();
    let mut layers = manifest.layers().clone();
    let mut extra = manifest.config().clone();
    extra.set_digest(digest("9"));
    layers.push(extra);
    manifest.set_layers(layers);
    let store = BlobStore::new(temp_dir.path());
    let written = store.write(&manifest).unwrap();

    let index_path = temp_dir.path().join(INDEX_FILE);
    let mut index: ImageIndex = serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    let mut entries = index.manifests().clone();
    entries[0].set_digest(written.digest.clone());
    entries[0].set_size(written.size);
    index.set_manifests(entries);
    fs::write(&index_path, serde_json::to_vec(&index).unwrap()).unwrap();
    let before = fs::read(&index_path).unwrap();

    let mut broken = Image::load(temp_dir.path()).unwrap();
    let err = broken.save().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(fs::read(&index_path).unwrap(), before);
}

#[test]
fn test_empty_index_is_not_found() {
    let temp_dir = tempdir().unwrap();
    fs::write(
        temp_dir.path().join(INDEX_FILE),
        r#"{"schemaVersion":2,"manifests":[]}"#,
    )
    .unwrap();

    let err = Image::load(temp_dir.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_missing_image_dir_is_not_found() {
    let temp_dir = tempdir().unwrap();
    let err = Image::load(temp_dir.path().join("nothing-here")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_legacy_ref_layout_is_upgraded_on_save() {
    let temp_dir = tempdir().unwrap();
    Image::init(temp_dir.path(), None).unwrap();

    // Rewrite the layout as refs/<name> holding the manifest descriptor
    let index_path = temp_dir.path().join(INDEX_FILE);
    let index: ImageIndex = serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    let refs_dir = temp_dir.path().join(REFS_DIR);
    fs::create_dir_all(&refs_dir).unwrap();
    fs::write(
        refs_dir.join("legacy"),
        serde_json::to_vec(&index.manifests()[0]).unwrap(),
    )
    .unwrap();
    fs::remove_file(&index_path).unwrap();

    let mut image = Image::load(temp_dir.path()).unwrap();
    assert_eq!(image.ref_name(), Some("legacy"));
    assert!(matches!(image.layout(), PointerLayout::LegacyRef(name) if name == "legacy"));

    image.set_working_dir("/app").unwrap();
    image.save().unwrap();
    assert!(index_path.exists());

    let reloaded = Image::load(temp_dir.path()).unwrap();
    assert_eq!(reloaded.ref_name(), Some("legacy"));
    assert!(matches!(reloaded.layout(), PointerLayout::Index { .. }));
    let manifest: ImageManifest = reloaded
        .store()
        .read_json(reloaded.pointer().digest())
        .unwrap();
    assert_eq!(&manifest, reloaded.manifest());
}
