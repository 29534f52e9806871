//! Top-layer lifecycle across build steps: dirty tracking, rehash, new
//! layers, extraction caching and locking.

use super::common::{
    append_index_entry, blob_listing, descriptor, index_bytes, initialized_session, session,
    store_nested_index, write_top_layer,
};
use flate2::read::GzDecoder;
use oci_spec::image::{ImageIndex, MediaType};
use ocibuild::layer::dirty_marker_path;
use ocibuild::lock::DirLock;
use ocibuild::pointer::{INDEX_FILE, REFS_DIR};
use ocibuild::{BlobStore, ErrorKind, Image, PointerLayout};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::Read;
use tempfile::tempdir;

#[test]
fn test_first_write_creates_single_layer() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());

    write_top_layer(&mut session, &[("etc/hostname", "builder\n")]);

    let image = session.load_image().unwrap();
    assert_eq!(image.layer_digests().len(), 1);
    let top = image.top_layer_digest().unwrap();
    let content = fs::read_to_string(session.layer_dir(&top).join("etc/hostname")).unwrap();
    assert_eq!(content, "builder\n");
}

#[test]
fn test_dirty_top_layer_is_rehashed() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    session.new_layer().unwrap();
    let before = session.load_image().unwrap();
    let old_top = before.top_layer_digest().unwrap();

    let dir = session.open_top_layer().unwrap();
    assert_eq!(dir, session.layer_dir(&old_top));
    assert!(dirty_marker_path(&dir).exists());
    fs::write(dir.join("app.conf"), "debug = true\n").unwrap();

    assert!(session.rehash_top_layer().unwrap());

    let after = session.load_image().unwrap();
    let new_top = after.top_layer_digest().unwrap();
    assert_ne!(new_top, old_top);
    assert_eq!(after.layer_digests().len(), before.layer_digests().len());
    assert_ne!(after.diff_ids(), before.diff_ids());
    assert!(!dirty_marker_path(&dir).exists());
    assert!(session.layer_dir(&new_top).join("app.conf").exists());
    assert!(after.store().exists(&new_top));
}

#[test]
fn test_clean_top_layer_rehash_writes_nothing() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("a.txt", "a")]);

    let blobs = blob_listing(&session);
    let index = index_bytes(&session);

    assert!(!session.rehash_top_layer().unwrap());
    assert_eq!(blob_listing(&session), blobs);
    assert_eq!(index_bytes(&session), index);
}

#[test]
fn test_rehash_is_idempotent() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("a.txt", "a")]);
    let top = session.load_image().unwrap().top_layer_digest();

    // Marking dirty without changing anything reproduces the same blob
    session.open_top_layer().unwrap();
    assert!(session.rehash_top_layer().unwrap());
    assert_eq!(session.load_image().unwrap().top_layer_digest(), top);

    assert!(!session.rehash_top_layer().unwrap());
    assert_eq!(session.load_image().unwrap().top_layer_digest(), top);
}

#[test]
fn test_new_layer_finalizes_dirty_top_layer() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());

    let dir = session.open_top_layer().unwrap();
    fs::write(dir.join("first.txt"), "1").unwrap();

    let new_top = session.new_layer().unwrap();
    let image = session.load_image().unwrap();
    let layers = image.layer_digests();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[1], new_top);
    assert!(session.layer_dir(&layers[0]).join("first.txt").exists());
    assert!(!session.layer_dir(&new_top).join("first.txt").exists());
}

#[test]
fn test_new_layer_adds_exactly_one_layer() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());

    for expected in 1..=3 {
        session.new_layer().unwrap();
        let image = session.load_image().unwrap();
        assert_eq!(image.layer_digests().len(), expected);
        assert_eq!(image.diff_ids().len(), expected);
    }
}

#[test]
fn test_layer_blob_matches_diff_id() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("bin/tool", "#!/bin/sh\n")]);

    let image = session.load_image().unwrap();
    let top = image.top_layer_digest().unwrap();
    let compressed = image.store().read(&top).unwrap();
    assert_eq!(
        format!("sha256:{}", hex::encode(Sha256::digest(&compressed))),
        top.to_string()
    );

    let mut tar = Vec::new();
    GzDecoder::new(&compressed[..]).read_to_end(&mut tar).unwrap();
    assert_eq!(
        format!("sha256:{}", hex::encode(Sha256::digest(&tar))),
        image.diff_ids()[0]
    );
    assert_eq!(image.manifest().layers()[0].size(), compressed.len() as u64);
}

#[test]
fn test_expand_all_layers_is_cached() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("a.txt", "a")]);
    session.new_layer().unwrap();
    write_top_layer(&mut session, &[("b.txt", "b")]);

    fs::remove_dir_all(session.expanded_dir()).unwrap();

    let mut seen = Vec::new();
    let report = session
        .expand_all_layers(|current, total, _| seen.push((current, total)))
        .unwrap();
    assert_eq!(seen, vec![(1, 2), (2, 2)]);
    assert_eq!(report.extracted.len(), 2);
    assert!(report.cached.is_empty());

    let layers = session.load_image().unwrap().layer_digests();
    assert!(session.layer_dir(&layers[0]).join("a.txt").exists());
    assert!(session.layer_dir(&layers[1]).join("b.txt").exists());
    // Layers are expanded side by side, never overlaid
    assert!(!session.layer_dir(&layers[1]).join("a.txt").exists());

    let report = session.expand_all_layers(|_, _, _| {}).unwrap();
    assert!(report.extracted.is_empty());
    assert_eq!(report.cached, layers);
}

#[test]
fn test_unchanged_layers_survive_gc() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("a.txt", "a")]);
    session.new_layer().unwrap();
    write_top_layer(&mut session, &[("b.txt", "b")]);

    let image = session.load_image().unwrap();
    for layer in image.layer_digests() {
        assert!(image.store().exists(&layer));
    }
    assert!(image.store().exists(image.manifest().config().digest()));
    assert_eq!(image.collect_garbage().unwrap().removed, 0);
}

#[test]
fn test_locked_image_rejects_new_layer() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    let index = index_bytes(&session);

    let held = DirLock::acquire(&session.config().lock_path).unwrap();
    let err = session.new_layer().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert_eq!(index_bytes(&session), index);

    held.release().unwrap();
    session.new_layer().unwrap();
    assert_eq!(session.load_image().unwrap().layer_digests().len(), 1);
}

#[test]
fn test_each_step_uses_its_own_session() {
    let temp_dir = tempdir().unwrap();
    initialized_session(temp_dir.path());

    let mut step_one = session(temp_dir.path());
    let dir = step_one.open_top_layer().unwrap();
    fs::write(dir.join("one"), "1").unwrap();
    drop(step_one);

    let mut step_two = session(temp_dir.path());
    assert!(step_two.rehash_top_layer().unwrap());
    let image = step_two.load_image().unwrap();
    let top = image.top_layer_digest().unwrap();
    assert!(step_two.layer_dir(&top).join("one").exists());
}

#[test]
fn test_locked_image_rejects_expansion() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    write_top_layer(&mut session, &[("a.txt", "a")]);
    let top = session.load_image().unwrap().top_layer_digest().unwrap();
    let top_dir = session.layer_dir(&top);
    fs::remove_dir_all(session.expanded_dir()).unwrap();

    let held = DirLock::acquire(&session.config().lock_path).unwrap();
    let err = session.open_top_layer().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    let err = session.expand_top_layer().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    let err = session.expand_all_layers(|_, _, _| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert!(!top_dir.exists());
    assert!(!dirty_marker_path(&top_dir).exists());

    held.release().unwrap();
    assert_eq!(session.open_top_layer().unwrap(), top_dir);
    assert!(dirty_marker_path(&top_dir).exists());
}

#[test]
fn test_gc_keeps_content_of_other_index_entries() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    let (nested, nested_blobs) = store_nested_index(session.image_dir());
    append_index_entry(session.image_dir(), nested.clone());

    write_top_layer(&mut session, &[("a.txt", "a")]);
    session.new_layer().unwrap();

    let store = BlobStore::new(session.image_dir());
    for digest in &nested_blobs {
        assert!(store.exists(digest), "{} was collected", digest);
    }
    let index: ImageIndex =
        serde_json::from_slice(&fs::read(session.image_dir().join(INDEX_FILE)).unwrap()).unwrap();
    assert_eq!(index.manifests().len(), 2);
    assert_eq!(index.manifests()[1], nested);

    // Superseded blobs of the active image are still swept
    let image = session.load_image().unwrap();
    let summary = image.collect_garbage().unwrap();
    assert!(!summary.skipped);
    assert_eq!(summary.removed, 0);
    assert_eq!(store.list().unwrap().len(), summary.kept);
}

#[test]
fn test_gc_skips_unknown_root_types() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    let store = BlobStore::new(session.image_dir());
    let artifact = store.write_bytes(b"{\"kind\":\"artifact\"}").unwrap();
    append_index_entry(
        session.image_dir(),
        descriptor(
            MediaType::Other("application/vnd.example.artifact.v1+json".to_string()),
            &artifact,
        ),
    );
    let orphan = store.write_bytes(b"nothing points here").unwrap();

    session.new_layer().unwrap();

    assert!(store.exists(&artifact.digest));
    assert!(store.exists(&orphan.digest));
    let summary = session.load_image().unwrap().collect_garbage().unwrap();
    assert!(summary.skipped);
    assert_eq!(summary.removed, 0);
}

#[test]
fn test_legacy_upgrade_keeps_nested_index() {
    let temp_dir = tempdir().unwrap();
    let mut session = initialized_session(temp_dir.path());
    let image_dir = session.image_dir().to_path_buf();

    // Move the active manifest to refs/ and leave only a nested index behind
    let index_path = image_dir.join(INDEX_FILE);
    let index: ImageIndex = serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    fs::create_dir_all(image_dir.join(REFS_DIR)).unwrap();
    fs::write(
        image_dir.join(REFS_DIR).join("latest"),
        serde_json::to_vec(&index.manifests()[0]).unwrap(),
    )
    .unwrap();
    let (nested, nested_blobs) = store_nested_index(&image_dir);
    fs::write(
        &index_path,
        format!(
            r#"{{"schemaVersion":2,"manifests":[{}]}}"#,
            serde_json::to_string(&nested).unwrap()
        ),
    )
    .unwrap();
    assert!(matches!(
        Image::load(&image_dir).unwrap().layout(),
        PointerLayout::LegacyRef(_)
    ));

    session.new_layer().unwrap();

    let index: ImageIndex = serde_json::from_slice(&fs::read(&index_path).unwrap()).unwrap();
    assert_eq!(index.manifests().len(), 2);
    assert_eq!(index.manifests()[0], nested);
    let store = BlobStore::new(&image_dir);
    for digest in &nested_blobs {
        assert!(store.exists(digest), "{} was collected", digest);
    }
    assert_eq!(session.load_image().unwrap().layer_digests().len(), 1);
}
