use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::console::Console;
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Success,
    NestedTestsFailed,
    Timeout,
}

impl RelayOutcome {
    /// Turn a non-success outcome into the error the harness reports.
    pub fn into_result(self) -> Result<()> {
        match self {
            RelayOutcome::Success => Ok(()),
            RelayOutcome::NestedTestsFailed => Err(Error::nested_tests_failed(
                "nested suite failed: the guest test run reported failure",
            )),
            RelayOutcome::Timeout => Err(Error::expect_timeout(
                "nested suite timed out: no result sentinel from the guest",
            )),
        }
    }
}

/// `echo` argument that prints `sentinel` but does not contain it literally, so the
/// console echo of the typed command can never be mistaken for the result.
fn split_echo_arg(sentinel: &str) -> String {
    let mid = sentinel
        .char_indices()
        .nth(sentinel.chars().count() / 2)
        .map_or(sentinel.len(), |(i, _)| i);
    let (head, tail) = sentinel.split_at(mid);
    format!("'{head}''{tail}'")
}

/// The single command line sent to the guest shell.
pub fn command_line(cfg: &RelayConfig) -> String {
    format!(
        "if apt-get install -y --allow-downgrades {pkg} \
         && mkdir -p {mnt} \
         && mount -t 9p -o trans=virtio,version=9p2000.L {tag} {mnt} \
         && cd {mnt} \
         && {cmd}; \
         then echo {pass}; else echo {fail}; fi\r\n",
        pkg = cfg.package,
        mnt = shell_words::quote(&cfg.mount_point),
        tag = cfg.mount_tag,
        cmd = cfg.command,
        pass = split_echo_arg(&cfg.pass_sentinel),
        fail = split_echo_arg(&cfg.fail_sentinel),
    )
}

/// Run the nested guest suite from a logged-in shell and classify the result.
///
/// Only console EOF and write failures come back as `Err`; a stalled guest is
/// `Ok(RelayOutcome::Timeout)`.
pub fn run_relay(console: &mut Console, cfg: &RelayConfig, sudo_password: &str) -> Result<RelayOutcome> {
    if cfg.become_root {
        become_root(console, cfg, sudo_password)?;
    }

    info!("relay: starting nested suite in guest");
    console.send(&command_line(cfg))?;

    // The marker is emitted by the nested runner itself, so reaching it means the
    // install and mount succeeded and the command echo is behind us.
    let started = [cfg.start_marker.as_str(), cfg.fail_sentinel.as_str()];
    match classify(console.expect_any(&started, cfg.install_timeout()))? {
        Some(0) => {}
        Some(_) => {
            warn!("relay: guest setup failed before the nested suite started");
            return Ok(RelayOutcome::NestedTestsFailed);
        }
        None => {
            warn!(
                "relay: nested suite did not start within {}s",
                cfg.install_timeout_secs
            );
            return Ok(RelayOutcome::Timeout);
        }
    }

    let verdict = [cfg.pass_sentinel.as_str(), cfg.fail_sentinel.as_str()];
    let outcome = match classify(console.expect_any(&verdict, cfg.suite_timeout()))? {
        Some(0) => RelayOutcome::Success,
        Some(_) => RelayOutcome::NestedTestsFailed,
        None => RelayOutcome::Timeout,
    };
    info!("relay: {outcome:?}");
    Ok(outcome)
}

// Timeouts become `None`; every other error propagates.
fn classify(res: Result<usize>) -> Result<Option<usize>> {
    match res {
        Ok(idx) => Ok(Some(idx)),
        Err(e) if e.kind() == ErrorKind::ExpectTimeout => {
            warn!("{e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn become_root(console: &mut Console, cfg: &RelayConfig, password: &str) -> Result<()> {
    console.send("sudo -i\r\n")?;
    console
        .expect("password for", cfg.step_timeout())
        .map_err(|e| e.context("sudo"))?;
    console.send(&format!("{password}\r\n"))?;
    console
        .expect(":~#", cfg.step_timeout())
        .map_err(|e| e.context("sudo"))?;
    Ok(())
}
