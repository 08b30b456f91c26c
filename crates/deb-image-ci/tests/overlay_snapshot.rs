#![cfg(unix)]

mod common;

use std::fs;

use deb_image_ci::ErrorKind;
use deb_image_ci::snapshot;

#[test]
fn missing_base_image_fails_before_qemu_img_runs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let qemu_img = common::fake_qemu_img(tmp.path());

    let err = snapshot::create_overlay(&qemu_img, &tmp.path().join("nope.img")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotCreation);
    assert!(err.to_string().contains("nope.img"), "{err}");
    assert!(!tmp.path().join("calls").exists());
}

#[test]
fn overlay_references_base_by_absolute_path() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let overlay = common::overlay(tmp.path());

    let calls = fs::read_to_string(tmp.path().join("calls")).expect("calls");
    let base = tmp.path().join("disk-ufs.img").canonicalize().expect("canon");
    assert!(
        calls.starts_with(&format!("create -b {} -f qcow2 -F raw ", base.display())),
        "{calls}"
    );
    assert!(overlay.path().is_file());
    assert_eq!(overlay.base(), base.as_path());

    // Base is never touched.
    assert_eq!(fs::read(&base).expect("base").len(), 4096);

    let dir = overlay.dir().to_path_buf();
    overlay.close().expect("close");
    assert!(!dir.exists());
}

#[test]
fn overlays_are_independent() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let a = common::overlay(tmp.path());
    let b = common::overlay(tmp.path());
    assert_ne!(a.dir(), b.dir());
    drop(a);
    assert!(b.path().is_file());
}
