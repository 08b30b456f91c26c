use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_console_line;

/// Observer for raw console output. Runs on the console reader thread.
pub trait ConsoleSink: Send {
    fn output(&mut self, chunk: &[u8]);

    /// Called once the stream hits EOF.
    fn finish(&mut self) {}
}

/// Re-emits console output as `tracing` events on target `console`, one per line.
#[derive(Default)]
pub struct TracingSink {
    pending: Vec<u8>,
}

impl TracingSink {
    const MAX_PENDING_BYTES: usize = 16 * 1024;

    fn flush_line(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = sanitize_console_line(&self.pending);
        self.pending.clear();
        if !line.trim().is_empty() {
            info!(target: "console", "{line}");
        }
    }
}

impl ConsoleSink for TracingSink {
    fn output(&mut self, chunk: &[u8]) {
        for b in chunk {
            if *b == b'\n' || *b == b'\r' {
                self.flush_line();
            } else {
                self.pending.push(*b);
                if self.pending.len() >= Self::MAX_PENDING_BYTES {
                    self.flush_line();
                }
            }
        }
    }

    fn finish(&mut self) {
        self.flush_line();
    }
}

/// Appends the raw, unsanitized byte stream to a file.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create dir {}: {e}", parent.display()))
            })?;
        }
        let file = File::create(path).map_err(|e| {
            Error::msg(format!(
                "failed to create transcript {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// `<dir>/console-YYYYmmdd-HHMMSS.log`
    pub fn timestamped(dir: &Path) -> Result<Self> {
        let name = format!(
            "console-{}.log",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );
        Self::create(&dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConsoleSink for FileSink {
    fn output(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(chunk) {
            warn!("transcript {} disabled after write error: {e}", self.path.display());
            self.file = None;
        }
    }

    fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}
