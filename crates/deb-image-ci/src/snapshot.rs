use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::info;

use crate::error::{Error, Result};

const OVERLAY_FILE: &str = "overlay.qcow2";

/// A qcow2 copy-on-write layer over a raw base image, living in its own temp dir.
///
/// Dropping the overlay deletes the directory; `close` does the same but reports errors.
#[derive(Debug)]
pub struct Overlay {
    dir: TempDir,
    path: PathBuf,
    base: PathBuf,
}

impl Overlay {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn close(self) -> Result<()> {
        let dir = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| Error::msg(format!("failed to remove overlay dir {}: {e}", dir.display())))
    }
}

/// Create an overlay backed by `base_image` using `qemu_img`.
///
/// The base image must exist; it is referenced by absolute path and never written.
pub fn create_overlay(qemu_img: &Path, base_image: &Path) -> Result<Overlay> {
    if !base_image.is_file() {
        return Err(Error::snapshot_creation(format!(
            "base image not found: {}",
            base_image.display()
        )));
    }
    let base = base_image.canonicalize().map_err(|e| {
        Error::snapshot_creation(format!(
            "failed to resolve base image {}: {e}",
            base_image.display()
        ))
    })?;

    let dir = tempfile::Builder::new()
        .prefix("qemu-cow-")
        .tempdir()
        .map_err(|e| Error::snapshot_creation(format!("failed to create overlay dir: {e}")))?;
    let path = dir.path().join(OVERLAY_FILE);

    let mut cmd = Command::new(qemu_img);
    cmd.arg("create")
        .arg("-b")
        .arg(&base)
        .args(["-f", "qcow2", "-F", "raw"])
        .arg(&path);
    info!("running: {:?}", cmd);

    let out = cmd.output().map_err(|e| {
        Error::snapshot_creation(format!("failed to run {}: {e}", qemu_img.display()))
    })?;
    if !out.status.success() {
        return Err(Error::snapshot_creation(format!(
            "{} create failed ({}): {}",
            qemu_img.display(),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    if !path.is_file() {
        return Err(Error::snapshot_creation(format!(
            "{} reported success but {} was not created",
            qemu_img.display(),
            path.display()
        )));
    }

    Ok(Overlay { dir, path, base })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    // Stand-in for qemu-img: records its argv and creates the last argument.
    fn fake_qemu_img(dir: &Path, exit_code: i32) -> PathBuf {
        let path = dir.join("qemu-img");
        let script = format!(
            "#!/bin/sh\necho \"$@\" > \"{}\"\nfor last; do :; done\n[ {exit_code} -eq 0 ] && : > \"$last\"\necho 'synthetic failure' >&2\nexit {exit_code}\n",
            dir.join("argv").display()
        );
        fs::write(&path, script).expect("write fake qemu-img");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[test]
    fn overlay_created_and_removed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("disk-ufs.img");
        fs::write(&base, b"raw").expect("write base");
        let tool = fake_qemu_img(tmp.path(), 0);

        let overlay = create_overlay(&tool, &base).expect("overlay");
        assert!(overlay.path().is_file());
        assert!(overlay.path().starts_with(overlay.dir()));

        let argv = fs::read_to_string(tmp.path().join("argv")).expect("argv");
        assert!(argv.starts_with("create -b /"), "{argv}");
        assert!(argv.contains("-f qcow2 -F raw"), "{argv}");
        assert_eq!(fs::read(&base).expect("base"), b"raw");

        let dir = overlay.dir().to_path_buf();
        overlay.close().expect("close");
        assert!(!dir.exists());
    }

    #[test]
    fn missing_base_fails_without_running_tool() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tool = fake_qemu_img(tmp.path(), 0);

        let err = create_overlay(&tool, &tmp.path().join("nope.img")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SnapshotCreation);
        assert!(!tmp.path().join("argv").exists(), "qemu-img must not run");
    }

    #[test]
    fn tool_failure_is_propagated_verbatim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = tmp.path().join("disk.img");
        fs::write(&base, b"raw").expect("write base");
        let tool = fake_qemu_img(tmp.path(), 3);

        let err = create_overlay(&tool, &base).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SnapshotCreation);
        assert!(err.to_string().contains("synthetic failure"), "{err}");
    }
}
