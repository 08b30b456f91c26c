use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{HarnessConfig, LoginConfig, RelayConfig};
use crate::console::{Cancel, Console, ConsoleSink, FileSink, TracingSink};
use crate::error::{Error, ErrorKind, Result};
use crate::relay::{self, RelayOutcome};
use crate::snapshot::{self, Overlay};
use crate::vm::{self, DiskFormat, Machine, QemuCommand, QemuProcess};

const EXIT_STATUS_POLLS: usize = 10;
const EXIT_STATUS_POLL: Duration = Duration::from_millis(50);

/// One disposable VM: overlay, process and console, torn down exactly once.
pub struct Session<M: Machine> {
    overlay: Option<Overlay>,
    machine: Option<M>,
    console: Console,
    logged_in: bool,
}

impl Session<QemuProcess> {
    /// Check host tools, snapshot the base image and boot it with the console on stdio.
    /// Setting `cancel` makes the pending console wait fail with `Interrupted`.
    pub fn start(cfg: &HarnessConfig, shared_dir: Option<&Path>, cancel: &Cancel) -> Result<Self> {
        let toolchain = vm::check_dependencies(&cfg.vm)?;
        let overlay = snapshot::create_overlay(&toolchain.qemu_img, &cfg.vm.image_path())?;
        info!(
            "overlay {} (base {})",
            overlay.path().display(),
            overlay.base().display()
        );

        let mut cmd = QemuCommand::new(&toolchain, &cfg.vm, overlay.path(), DiskFormat::Qcow2)
            .cache_unsafe(true);
        if let Some(dir) = shared_dir {
            let dir = dir.canonicalize().map_err(|e| {
                Error::msg(format!("share dir {} unusable: {e}", dir.display()))
            })?;
            cmd = cmd.share(&dir, &cfg.relay.mount_tag);
        }

        let mut sinks: Vec<Box<dyn ConsoleSink>> = vec![Box::new(TracingSink::default())];
        if let Some(path) = cfg.transcript.as_deref() {
            let path = Path::new(path);
            let sink = if path.is_dir() {
                FileSink::timestamped(path)?
            } else {
                FileSink::create(path)?
            };
            info!("console transcript: {}", sink.path().display());
            sinks.push(Box::new(sink));
        }

        // On error the overlay drops here and removes its directory.
        let (process, stdout, stdin) = vm::start(&cmd)?;
        let console = Console::with_sinks(stdout, stdin, sinks).with_cancel(cancel.clone());
        Ok(Session::from_parts(overlay, process, console))
    }
}

impl<M: Machine> Session<M> {
    pub fn from_parts(overlay: Overlay, machine: M, console: Console) -> Self {
        Self {
            overlay: Some(overlay),
            machine: Some(machine),
            console,
            logged_in: false,
        }
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn overlay_path(&self) -> Option<PathBuf> {
        self.overlay.as_ref().map(|o| o.path().to_path_buf())
    }

    /// First boot: log in with the default credentials and go through the forced
    /// password change, ending at a shell prompt.
    pub fn login(&mut self, cfg: &LoginConfig) -> Result<()> {
        if let Err(e) = self.login_inner(cfg) {
            return Err(self.explain(e).context("login"));
        }
        self.logged_in = true;
        info!("logged in as {}", cfg.username);
        Ok(())
    }

    fn login_inner(&mut self, cfg: &LoginConfig) -> Result<()> {
        let c = &mut self.console;
        let step = cfg.step_timeout();

        c.expect(&cfg.login_prompt(), cfg.boot_timeout())?;
        c.send(&format!("{}\r\n", cfg.username))?;
        c.expect("Password:", step)?;
        c.send(&format!("{}\r\n", cfg.password))?;
        c.expect("You are required to change your password immediately", step)?;
        c.expect("Current password:", step)?;
        c.send(&format!("{}\r\n", cfg.password))?;
        c.expect("New password:", step)?;
        c.send(&format!("{}\r\n", cfg.new_password))?;
        c.expect("Retype new password:", step)?;
        c.send(&format!("{}\r\n", cfg.new_password))?;
        c.expect(&cfg.shell_prompt(), step)?;
        Ok(())
    }

    pub fn relay(&mut self, cfg: &RelayConfig, sudo_password: &str) -> Result<RelayOutcome> {
        if !self.logged_in {
            return Err(Error::msg("relay: guest shell not logged in"));
        }
        match relay::run_relay(&mut self.console, cfg, sudo_password) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.explain(e).context("relay")),
        }
    }

    // A closed console usually means qemu died; say how.
    fn explain(&mut self, e: Error) -> Error {
        if e.kind() != ErrorKind::ConsoleClosed {
            return e;
        }
        let Some(machine) = self.machine.as_mut() else {
            return e;
        };
        // EOF can beat the exit status by a few milliseconds.
        for _ in 0..EXIT_STATUS_POLLS {
            match machine.try_status() {
                Ok(Some(status)) => {
                    return Error::new(e.kind(), format!("{e} (qemu exited: {status})"));
                }
                Ok(None) => std::thread::sleep(EXIT_STATUS_POLL),
                Err(_) => break,
            }
        }
        e
    }

    /// Kill the VM (blocking until reaped) and delete the overlay. Later calls are no-ops.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(mut machine) = self.machine.take()
            && let Err(e) = machine.terminate()
        {
            first_err = Some(e);
        }
        if let Some(overlay) = self.overlay.take()
            && let Err(e) = overlay.close()
            && first_err.is_none()
        {
            first_err = Some(e);
        }
        match first_err {
            Some(e) => Err(e.context("teardown")),
            None => Ok(()),
        }
    }
}

impl<M: Machine> Drop for Session<M> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("{e}");
        }
    }
}

/// Boot, log in, relay the nested suite, tear down. The error names the failed phase.
pub fn run_verification(cfg: &HarnessConfig, share: Option<&Path>, cancel: &Cancel) -> Result<()> {
    let started = Instant::now();
    let share = if cfg.relay.enabled {
        Some(share.unwrap_or_else(|| Path::new(&cfg.relay.share_dir)))
    } else {
        None
    };

    let mut session = Session::<QemuProcess>::start(cfg, share, cancel)?;
    let res = drive(&mut session, cfg);
    let teardown = session.teardown();

    let elapsed = started.elapsed().as_secs();
    match &res {
        Ok(()) => info!("verification passed in {elapsed}s"),
        Err(e) => {
            warn!("verification failed after {elapsed}s: {e}");
            if let Err(t) = &teardown {
                warn!("{t}");
            }
        }
    }
    res?;
    teardown
}

/// The interaction script proper; separate from `run_verification` so it can be
/// driven against a scripted console.
pub fn drive<M: Machine>(session: &mut Session<M>, cfg: &HarnessConfig) -> Result<()> {
    session.login(&cfg.login)?;
    if !cfg.relay.enabled {
        return Ok(());
    }
    session.relay(&cfg.relay, cfg.sudo_password())?.into_result()
}
