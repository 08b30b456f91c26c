use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{StorageType, VmConfig};
use crate::console::Cancel;
use crate::error::{Error, Result};
use crate::snapshot;
use crate::vm::{self, DiskFormat, Display, HostOs, QemuCommand};

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub image: Option<PathBuf>,
    pub storage: Option<StorageType>,
    /// Boot the image itself; writes go straight to disk.
    pub no_cow: bool,
    pub headless: bool,
    /// Extra qemu arguments, split with shell rules.
    pub qemu_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChoice {
    pub path: PathBuf,
    pub storage: StorageType,
}

/// Pick the disk image and its storage type.
///
/// An explicit image must exist; its storage comes from `storage`, then its file
/// name, then defaults to UFS. Without an image, the default file for `storage` is
/// used, or whichever of `disk-ufs.img`/`disk-sdcard.img` exists in `dir`.
pub fn resolve_image(image: Option<&Path>, storage: Option<StorageType>, dir: &Path) -> Result<ImageChoice> {
    if let Some(image) = image {
        if !image.exists() {
            return Err(Error::msg(format!("image not found: {}", image.display())));
        }
        let storage = storage
            .or_else(|| StorageType::infer_from_path(image))
            .unwrap_or(StorageType::Ufs);
        return Ok(ImageChoice {
            path: image.to_path_buf(),
            storage,
        });
    }

    if let Some(storage) = storage {
        let path = dir.join(storage.default_image());
        if !path.exists() {
            return Err(Error::msg(format!(
                "requested storage '{}' but {} not found; please provide --image",
                storage_name(storage),
                storage.default_image()
            )));
        }
        return Ok(ImageChoice { path, storage });
    }

    for storage in [StorageType::Ufs, StorageType::Sdcard] {
        let path = dir.join(storage.default_image());
        if path.exists() {
            return Ok(ImageChoice { path, storage });
        }
    }
    Err(Error::msg(format!(
        "neither {} nor {} found; please provide --image",
        StorageType::Ufs.default_image(),
        StorageType::Sdcard.default_image()
    )))
}

fn storage_name(s: StorageType) -> &'static str {
    match s {
        StorageType::Ufs => "ufs",
        StorageType::Sdcard => "sdcard",
    }
}

/// Build the interactive qemu command for `disk`.
pub fn launch_command(
    toolchain: &vm::Toolchain,
    base: &VmConfig,
    choice: &ImageChoice,
    disk: &Path,
    format: DiskFormat,
    opts: &LaunchOptions,
) -> Result<QemuCommand> {
    let cfg = VmConfig {
        image: choice.path.to_string_lossy().into_owned(),
        storage: Some(choice.storage),
        ..base.clone()
    };
    let display = if opts.headless {
        Display::Headless
    } else {
        Display::Window(HostOs::current().default_display_backend().to_string())
    };
    let extra = match opts.qemu_args.as_deref() {
        Some(raw) => shell_words::split(raw)
            .map_err(|e| Error::msg(format!("invalid --qemu-args '{raw}': {e}")))?,
        None => Vec::new(),
    };
    Ok(QemuCommand::new(toolchain, &cfg, disk, format)
        .display(display)
        .extra_args(extra))
}

const WAIT_POLL: Duration = Duration::from_millis(100);

/// Boot an image for a human at the keyboard and return qemu's exit code.
/// Setting `cancel` kills qemu; the overlay is removed either way.
pub fn launch(base: &VmConfig, opts: &LaunchOptions, cancel: &Cancel) -> Result<i32> {
    let toolchain = vm::check_dependencies(base)?;
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let choice = resolve_image(opts.image.as_deref(), opts.storage, &cwd)?;
    info!(
        "image {} ({} byte sectors)",
        choice.path.display(),
        choice.storage.sector_size()
    );

    let overlay = if opts.no_cow {
        None
    } else {
        Some(snapshot::create_overlay(&toolchain.qemu_img, &choice.path)?)
    };
    let (disk, format) = match &overlay {
        Some(o) => (o.path().to_path_buf(), DiskFormat::Qcow2),
        None => (choice.path.clone(), DiskFormat::Raw),
    };

    let cmd = launch_command(&toolchain, base, &choice, &disk, format, opts)?;
    info!("running: {}", cmd.display_line());
    let child = cmd
        .command()
        .spawn()
        .map_err(|e| Error::msg(format!("failed to run qemu: {e}")))?;
    let status = wait_or_kill(child, cancel);

    if let Some(o) = overlay {
        o.close()?;
    }
    let status = status?;
    if !status.success() {
        info!("qemu exited with {status}");
    }
    if cancel.is_cancelled() {
        return Err(Error::interrupted("interrupted, qemu killed"));
    }
    Ok(status.code().unwrap_or(1))
}

fn wait_or_kill(mut child: Child, cancel: &Cancel) -> Result<ExitStatus> {
    loop {
        let status = child
            .try_wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if let Some(status) = status {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            warn!("killing qemu (pid {})", child.id());
            let _ = child.kill();
            return child
                .wait()
                .map_err(|e| Error::msg(format!("wait failed: {e}")));
        }
        std::thread::sleep(WAIT_POLL);
    }
}
