#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use deb_image_ci::Result;
use deb_image_ci::config::HarnessConfig;
use deb_image_ci::console::scripted::{GuestHandle, ScriptedGuest};
use deb_image_ci::session::Session;
use deb_image_ci::snapshot::{self, Overlay};
use deb_image_ci::vm::Machine;

/// Stands in for a qemu process; counts how often it is killed.
pub struct FakeMachine {
    kills: Arc<AtomicUsize>,
    status: Option<ExitStatus>,
}

impl FakeMachine {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let kills = Arc::new(AtomicUsize::new(0));
        (
            Self {
                kills: Arc::clone(&kills),
                status: None,
            },
            kills,
        )
    }

    /// A machine that has already exited with `code`.
    pub fn exited(code: i32) -> (Self, Arc<AtomicUsize>) {
        use std::os::unix::process::ExitStatusExt;
        let (mut machine, kills) = Self::new();
        machine.status = Some(ExitStatus::from_raw(code << 8));
        (machine, kills)
    }
}

impl Machine for FakeMachine {
    fn terminate(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.status)
    }
}

/// A `qemu-img` that creates an empty overlay file and logs its argv to `calls`.
pub fn fake_qemu_img(dir: &Path) -> PathBuf {
    let script = dir.join("qemu-img");
    let calls = dir.join("calls");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\nfor a; do last=$a; done\n: > \"$last\"\n",
            calls.display()
        ),
    )
    .expect("write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
    script
}

pub fn base_image(dir: &Path) -> PathBuf {
    let img = dir.join("disk-ufs.img");
    fs::write(&img, vec![0u8; 4096]).expect("write image");
    img
}

pub fn overlay(dir: &Path) -> Overlay {
    let qemu_img = fake_qemu_img(dir);
    snapshot::create_overlay(&qemu_img, &base_image(dir)).expect("overlay")
}

/// Short timeouts, no sudo hop.
pub fn quick_config() -> HarnessConfig {
    let mut cfg = HarnessConfig::default();
    cfg.login.boot_timeout_secs = 2;
    cfg.login.step_timeout_secs = 2;
    cfg.relay.become_root = false;
    cfg.relay.install_timeout_secs = 2;
    cfg.relay.suite_timeout_secs = 2;
    cfg.relay.step_timeout_secs = 2;
    cfg
}

/// A first boot up to the shell prompt, with the forced password change.
pub fn first_login() -> ScriptedGuest {
    ScriptedGuest::new()
        .emit("[  OK  ] Reached target multi-user.target.\r\n\r\nDebian GNU/Linux 13 debian ttyAMA0\r\n\r\n")
        .emit("debian login: ")
        .await_input("debian\r\n")
        .emit("Password: ")
        .await_input("debian\r\n")
        .emit("You are required to change your password immediately (administrator enforced).\r\n")
        .emit("Changing password for debian.\r\nCurrent password: ")
        .await_input("debian\r\n")
        .emit("New password: ")
        .await_input("new password\r\n")
        .emit("Retype new password: ")
        .await_input("new password\r\n")
        .emit("Linux debian 6.12.0-arm64\r\ndebian@debian:~$ ")
}

/// The guest reaches the nested runner and prints `verdict` after the summary.
pub fn nested_run(guest: ScriptedGuest, verdict: &str) -> ScriptedGuest {
    guest
        .await_input("fi\r\n")
        .emit("Reading package lists... Done\r\n")
        .emit("============================= test session starts ==============================\r\n")
        .emit("collected 12 items\r\n\r\nci/qemu_guest_test.py ............ [100%]\r\n")
        .emit(format!("{verdict}\r\ndebian@debian:~$ "))
}

pub struct Harness {
    pub session: Session<FakeMachine>,
    pub guest: GuestHandle,
    pub kills: Arc<AtomicUsize>,
    pub overlay_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

pub fn harness(guest: ScriptedGuest) -> Harness {
    harness_with(guest, FakeMachine::new())
}

pub fn harness_with(guest: ScriptedGuest, machine: (FakeMachine, Arc<AtomicUsize>)) -> Harness {
    let (machine, kills) = machine;
    let tmp = tempfile::tempdir().expect("tempdir");
    let overlay = overlay(tmp.path());
    let overlay_dir = overlay.dir().to_path_buf();
    let (console, guest) = guest.spawn_console();
    Harness {
        session: Session::from_parts(overlay, machine, console),
        guest,
        kills,
        overlay_dir,
        _tmp: tmp,
    }
}

pub fn kills(h: &Harness) -> usize {
    h.kills.load(Ordering::SeqCst)
}
