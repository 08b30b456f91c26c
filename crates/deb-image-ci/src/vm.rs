use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_console_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Other(&'static str),
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostOs::Linux,
            "macos" => HostOs::MacOs,
            other => HostOs::Other(other),
        }
    }

    pub fn install_hint(self) -> String {
        match self {
            HostOs::Linux => "On Linux systems with apt, install via:\n  \
                              apt install qemu-efi-aarch64 qemu-system-arm qemu-utils"
                .into(),
            HostOs::MacOs => "With Homebrew, install via:\n  brew install qemu".into(),
            HostOs::Other(os) => format!("Unknown host system '{os}', patches welcome!"),
        }
    }

    /// Gtk everywhere except macOS, which gets Cocoa.
    pub fn default_display_backend(self) -> &'static str {
        match self {
            HostOs::MacOs => "cocoa",
            _ => "gtk",
        }
    }
}

/// Well-known aarch64 UEFI firmware locations for this host, most preferred first.
pub fn firmware_candidates(os: HostOs) -> Vec<PathBuf> {
    match os {
        HostOs::Linux => vec![
            // qemu-efi-aarch64 on Debian bookworm+ and Ubuntu jammy+
            PathBuf::from("/usr/share/qemu-efi-aarch64/QEMU_EFI.fd"),
            PathBuf::from("/usr/share/AAVMF/AAVMF_CODE.fd"),
        ],
        HostOs::MacOs => brew_prefix("qemu")
            .map(|prefix| vec![prefix.join("share/qemu/edk2-aarch64-code.fd")])
            .unwrap_or_default(),
        HostOs::Other(_) => Vec::new(),
    }
}

fn brew_prefix(formula: &str) -> Option<PathBuf> {
    let brew = which::which("brew").ok()?;
    let out = Command::new(brew)
        .args(["--prefix", formula])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    let prefix = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (out.status.success() && !prefix.is_empty()).then(|| PathBuf::from(prefix))
}

pub fn resolve_firmware(cfg: &VmConfig, os: HostOs) -> Option<PathBuf> {
    if let Some(explicit) = cfg.firmware.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let p = PathBuf::from(explicit);
        return p.is_file().then_some(p);
    }
    firmware_candidates(os).into_iter().find(|p| p.is_file())
}

/// Host binaries and firmware a session needs, all verified to exist.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub qemu_system: PathBuf,
    pub qemu_img: PathBuf,
    pub firmware: PathBuf,
}

/// Locate qemu, qemu-img and firmware. Nothing is spawned if any of them is missing.
pub fn check_dependencies(cfg: &VmConfig) -> Result<Toolchain> {
    let os = HostOs::current();
    if let HostOs::Other(_) = os {
        return Err(Error::missing_dependency(os.install_hint()));
    }

    let qemu_system = which::which(&cfg.qemu_system).ok();
    let qemu_img = which::which(&cfg.qemu_img).ok();
    let firmware = resolve_firmware(cfg, os);

    let mut missing = Vec::new();
    if qemu_system.is_none() {
        missing.push(cfg.qemu_system.clone());
    }
    if qemu_img.is_none() {
        missing.push(cfg.qemu_img.clone());
    }
    if firmware.is_none() {
        missing.push(match cfg.firmware.as_deref() {
            Some(p) => format!("UEFI firmware ({p})"),
            None => "aarch64 UEFI firmware".into(),
        });
    }

    match (qemu_system, qemu_img, firmware) {
        (Some(qemu_system), Some(qemu_img), Some(firmware)) => {
            debug!(
                "toolchain: {} / {} / {}",
                qemu_system.display(),
                qemu_img.display(),
                firmware.display()
            );
            Ok(Toolchain {
                qemu_system,
                qemu_img,
                firmware,
            })
        }
        _ => Err(Error::missing_dependency(format!(
            "missing qemu components: {}\n{}",
            missing.join(", "),
            os.install_hint()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Display {
    /// Serial console on stdio, no window. What the test harness uses.
    Nographic,
    /// Window with virtio-gpu and USB keyboard/mouse.
    Window(String),
    /// GUI devices present but no window; serial and monitor on stdio.
    Headless,
}

#[derive(Debug, Clone)]
pub struct QemuCommand {
    binary: PathBuf,
    cpu: String,
    memory_mb: u32,
    machine: String,
    firmware: PathBuf,
    disk: PathBuf,
    disk_format: DiskFormat,
    cache_unsafe: bool,
    sector_size: u32,
    display: Display,
    share: Option<(PathBuf, String)>,
    extra: Vec<String>,
}

impl QemuCommand {
    pub fn new(toolchain: &Toolchain, cfg: &VmConfig, disk: &Path, disk_format: DiskFormat) -> Self {
        Self {
            binary: toolchain.qemu_system.clone(),
            cpu: cfg.cpu.clone(),
            memory_mb: cfg.memory_mb,
            machine: cfg.machine.clone(),
            firmware: toolchain.firmware.clone(),
            disk: disk.to_path_buf(),
            disk_format,
            cache_unsafe: false,
            sector_size: cfg.sector_size(),
            display: Display::Nographic,
            share: None,
            extra: cfg.extra_args.clone(),
        }
    }

    pub fn display(mut self, display: Display) -> Self {
        self.display = display;
        self
    }

    /// Skip host flushes; fine for throwaway overlays.
    pub fn cache_unsafe(mut self, on: bool) -> Self {
        self.cache_unsafe = on;
        self
    }

    /// Export `dir` to the guest over virtio-9p under `mount_tag`.
    pub fn share(mut self, dir: &Path, mount_tag: &str) -> Self {
        self.share = Some((dir.to_path_buf(), mount_tag.to_string()));
        self
    }

    pub fn extra_args<I: IntoIterator<Item = String>>(mut self, args: I) -> Self {
        self.extra.extend(args);
        self
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |s: String| args.push(OsString::from(s));

        push("-cpu".into());
        push(self.cpu.clone());
        push("-m".into());
        push(self.memory_mb.to_string());
        push("-M".into());
        push(self.machine.clone());

        match &self.display {
            Display::Nographic => push("-nographic".into()),
            Display::Window(backend) => gui_devices(&mut push, backend),
            Display::Headless => gui_devices(&mut push, "none"),
        }

        push("-device".into());
        push("virtio-scsi-pci,id=scsi1".into());
        push("-device".into());
        push(format!(
            "scsi-hd,bus=scsi1.0,drive=disk1,physical_block_size={0},logical_block_size={0}",
            self.sector_size
        ));
        let mut drive = format!(
            "if=none,file={},format={},id=disk1",
            escape_opt(&self.disk.to_string_lossy()),
            self.disk_format.as_str()
        );
        if self.cache_unsafe {
            drive.push_str(",cache=unsafe");
        }
        push("-drive".into());
        push(drive);

        if let Some((dir, tag)) = &self.share {
            push("-virtfs".into());
            push(format!(
                "local,path={},mount_tag={tag},security_model=none,id={tag}",
                escape_opt(&dir.to_string_lossy())
            ));
        }

        push("-bios".into());
        push(self.firmware.to_string_lossy().into_owned());

        if self.display == Display::Headless {
            push("-serial".into());
            push("mon:stdio".into());
        }

        for a in &self.extra {
            push(a.clone());
        }
        args
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd
    }

    /// Shell-ish rendering for logs.
    pub fn display_line(&self) -> String {
        let mut parts = vec![self.binary.to_string_lossy().into_owned()];
        parts.extend(self.args().iter().map(|a| a.to_string_lossy().into_owned()));
        shell_words::join(parts)
    }
}

fn gui_devices(push: &mut impl FnMut(String), backend: &str) {
    push("-device".into());
    push("virtio-gpu-pci".into());
    push("-display".into());
    push(backend.to_string());
    for dev in ["usb-ehci,id=ehci", "usb-kbd", "usb-mouse"] {
        push("-device".into());
        push(dev.into());
    }
}

// qemu option values use ',' as a separator; a literal comma is written as ',,'.
fn escape_opt(s: &str) -> String {
    s.replace(',', ",,")
}

/// The seam a session tears down through: kill the VM and wait for it.
pub trait Machine: Send {
    fn terminate(&mut self) -> Result<()>;

    /// Exit status if the VM has already gone away.
    fn try_status(&mut self) -> Result<Option<ExitStatus>>;
}

/// A running qemu with its serial console on stdio.
pub struct QemuProcess {
    child: Child,
    status: Option<ExitStatus>,
}

/// Spawn `cmd` with piped stdio. Returns the process plus the console's output and input.
pub fn start(cmd: &QemuCommand) -> Result<(QemuProcess, ChildStdout, ChildStdin)> {
    info!("running: {}", cmd.display_line());
    let mut command = cmd.command();

    // Own process group so terminate() takes any helpers down with it.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // Dies with the harness even when it is SIGKILLed.
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {}: {e}", cmd.binary.display())))?;

    if let Some(stderr) = child.stderr.take() {
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).split(b'\n').map_while(|l| l.ok()) {
                let line = sanitize_console_line(&line);
                if !line.is_empty() {
                    warn!(target: "qemu", "{line}");
                }
            }
        });
    }

    let stdout = child.stdout.take();
    let stdin = child.stdin.take();
    let mut process = QemuProcess {
        child,
        status: None,
    };
    match (stdout, stdin) {
        (Some(stdout), Some(stdin)) => Ok((process, stdout, stdin)),
        _ => {
            let _ = process.terminate();
            Err(Error::msg("qemu console pipes unavailable"))
        }
    }
}

impl QemuProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Machine for QemuProcess {
    fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(s) = self.status {
            return Ok(Some(s));
        }
        let s = self
            .child
            .try_wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        self.status = s;
        Ok(s)
    }

    // SIGKILL, then block until reaped. A hang here is preferable to leaking VMs.
    fn terminate(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        kill_pgroup(self.child.id());
        let _ = self.child.kill();
        let status = self
            .child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        info!("qemu (pid {}) exited: {status}", self.child.id());
        self.status = Some(status);
        Ok(())
    }
}

impl Drop for QemuProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("failed to reap qemu: {e}");
        }
    }
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain() -> Toolchain {
        Toolchain {
            qemu_system: PathBuf::from("/usr/bin/qemu-system-aarch64"),
            qemu_img: PathBuf::from("/usr/bin/qemu-img"),
            firmware: PathBuf::from("/fw/QEMU_EFI.fd"),
        }
    }

    fn args_of(cmd: &QemuCommand) -> Vec<String> {
        cmd.args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn harness_command_uses_serial_and_overlay() {
        let cfg = VmConfig {
            storage: Some(crate::config::StorageType::Sdcard),
            ..VmConfig::default()
        };
        let disk = Path::new("/tmp/q,1/overlay.qcow2");
        let cmd = QemuCommand::new(&toolchain(), &cfg, disk, DiskFormat::Qcow2)
            .cache_unsafe(true)
            .share(Path::new("/src/repo"), "host_ci");
        let args = args_of(&cmd);

        assert_eq!(value_after(&args, "-cpu"), ["cortex-a57"]);
        assert_eq!(value_after(&args, "-m"), ["2048"]);
        assert_eq!(value_after(&args, "-M"), ["virt"]);
        assert!(args.contains(&"-nographic".to_string()));
        assert_eq!(
            value_after(&args, "-drive"),
            ["if=none,file=/tmp/q,,1/overlay.qcow2,format=qcow2,id=disk1,cache=unsafe"]
        );
        assert!(value_after(&args, "-device").contains(
            &"scsi-hd,bus=scsi1.0,drive=disk1,physical_block_size=512,logical_block_size=512"
        ));
        assert_eq!(
            value_after(&args, "-virtfs"),
            ["local,path=/src/repo,mount_tag=host_ci,security_model=none,id=host_ci"]
        );
        assert_eq!(value_after(&args, "-bios"), ["/fw/QEMU_EFI.fd"]);
        assert!(value_after(&args, "-serial").is_empty());
    }

    #[test]
    fn headless_launcher_command() {
        let cfg = VmConfig::default();
        let cmd = QemuCommand::new(&toolchain(), &cfg, Path::new("disk-ufs.img"), DiskFormat::Raw)
            .display(Display::Headless)
            .extra_args(["-smp".to_string(), "4".to_string()]);
        let args = args_of(&cmd);

        assert!(!args.contains(&"-nographic".to_string()));
        assert_eq!(value_after(&args, "-display"), ["none"]);
        assert_eq!(value_after(&args, "-serial"), ["mon:stdio"]);
        assert_eq!(
            value_after(&args, "-drive"),
            ["if=none,file=disk-ufs.img,format=raw,id=disk1"]
        );
        assert_eq!(&args[args.len() - 2..], ["-smp", "4"]);
        assert!(
            cmd.display_line()
                .starts_with("/usr/bin/qemu-system-aarch64 -cpu cortex-a57")
        );
    }

    #[test]
    fn explicit_firmware_must_exist() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fw = tmp.path().join("edk2.fd");
        let cfg = VmConfig {
            firmware: Some(fw.to_string_lossy().into_owned()),
            ..VmConfig::default()
        };
        assert_eq!(resolve_firmware(&cfg, HostOs::Linux), None);
        std::fs::write(&fw, b"fw").expect("write fw");
        assert_eq!(resolve_firmware(&cfg, HostOs::Linux), Some(fw));
        assert!(firmware_candidates(HostOs::Other("plan9")).is_empty());
    }

    #[test]
    fn missing_qemu_is_reported_with_install_hint() {
        let cfg = VmConfig {
            qemu_system: "definitely-not-qemu-system-aarch64".into(),
            ..VmConfig::default()
        };
        let err = check_dependencies(&cfg).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MissingDependency);
        let msg = err.to_string();
        assert!(
            msg.contains("definitely-not-qemu-system-aarch64") || msg.contains("patches welcome"),
            "{msg}"
        );
        if cfg!(target_os = "linux") {
            assert!(msg.contains("apt install qemu-efi-aarch64"), "{msg}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn terminate_kills_and_reaps() {
        let mut child = Command::new("sleep");
        child.arg("30");
        let child = child.spawn().expect("spawn sleep");
        let mut process = QemuProcess {
            child,
            status: None,
        };
        assert!(process.try_status().expect("try_status").is_none());
        process.terminate().expect("terminate");
        let status = process.try_status().expect("try_status").expect("exited");
        assert!(!status.success());
        process.terminate().expect("second terminate is a no-op");
    }
}
