use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub const DEFAULT_UFS_IMAGE: &str = "disk-ufs.img";
pub const DEFAULT_SDCARD_IMAGE: &str = "disk-sdcard.img";

fn default_image() -> String {
    DEFAULT_UFS_IMAGE.into()
}

// Smallest memory size across supported boards.
fn default_memory_mb() -> u32 {
    2048
}

// Oldest CPU among supported boards.
fn default_cpu() -> String {
    "cortex-a57".into()
}

fn default_machine() -> String {
    "virt".into()
}

fn default_qemu_system() -> String {
    "qemu-system-aarch64".into()
}

fn default_qemu_img() -> String {
    "qemu-img".into()
}

fn default_debian() -> String {
    "debian".into()
}

fn default_new_password() -> String {
    "new password".into()
}

fn default_boot_timeout_secs() -> u64 {
    240
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_share_dir() -> String {
    ".".into()
}

fn default_mount_tag() -> String {
    "host_ci".into()
}

fn default_mount_point() -> String {
    "/mnt/host".into()
}

fn default_package() -> String {
    "python3-pytest".into()
}

fn default_command() -> String {
    "python3 -m pytest ci/qemu_guest_test.py".into()
}

fn default_start_marker() -> String {
    "test session starts".into()
}

fn default_pass_sentinel() -> String {
    "NESTED-SUITE-PASS-7f3c91".into()
}

fn default_fail_sentinel() -> String {
    "NESTED-SUITE-FAIL-7f3c91".into()
}

fn default_install_timeout_secs() -> u64 {
    600
}

fn default_suite_timeout_secs() -> u64 {
    900
}

/// Target storage; decides the disk's logical/physical sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Ufs,
    Sdcard,
}

impl StorageType {
    pub fn sector_size(self) -> u32 {
        match self {
            StorageType::Ufs => 4096,
            StorageType::Sdcard => 512,
        }
    }

    pub fn default_image(self) -> &'static str {
        match self {
            StorageType::Ufs => DEFAULT_UFS_IMAGE,
            StorageType::Sdcard => DEFAULT_SDCARD_IMAGE,
        }
    }

    /// Guess from an image file name such as `disk-ufs.img` or `disk-emmc.img`.
    pub fn infer_from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.contains("-ufs") {
            Some(StorageType::Ufs)
        } else if name.contains("-sdcard") || name.contains("-emmc") {
            Some(StorageType::Sdcard)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    #[serde(default = "default_image")]
    pub image: String,
    pub storage: Option<StorageType>,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_machine")]
    pub machine: String,
    #[serde(default = "default_qemu_system")]
    pub qemu_system: String,
    #[serde(default = "default_qemu_img")]
    pub qemu_img: String,
    pub firmware: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            storage: None,
            memory_mb: default_memory_mb(),
            cpu: default_cpu(),
            machine: default_machine(),
            qemu_system: default_qemu_system(),
            qemu_img: default_qemu_img(),
            firmware: None,
            extra_args: Vec::new(),
        }
    }
}

impl VmConfig {
    pub fn image_path(&self) -> PathBuf {
        PathBuf::from(self.image.trim())
    }

    /// Explicit storage wins, then the image name, then 4K.
    pub fn storage_type(&self) -> StorageType {
        self.storage
            .or_else(|| StorageType::infer_from_path(&self.image_path()))
            .unwrap_or(StorageType::Ufs)
    }

    pub fn sector_size(&self) -> u32 {
        self.storage_type().sector_size()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    #[serde(default = "default_debian")]
    pub hostname: String,
    #[serde(default = "default_debian")]
    pub username: String,
    #[serde(default = "default_debian")]
    pub password: String,
    #[serde(default = "default_new_password")]
    pub new_password: String,
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            hostname: default_debian(),
            username: default_debian(),
            password: default_debian(),
            new_password: default_new_password(),
            boot_timeout_secs: default_boot_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl LoginConfig {
    pub fn login_prompt(&self) -> String {
        format!("{} login:", self.hostname)
    }

    pub fn shell_prompt(&self) -> String {
        format!("{}@{}:~$", self.username, self.hostname)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_share_dir")]
    pub share_dir: String,
    #[serde(default = "default_mount_tag")]
    pub mount_tag: String,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_package")]
    pub package: String,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_start_marker")]
    pub start_marker: String,
    #[serde(default = "default_pass_sentinel")]
    pub pass_sentinel: String,
    #[serde(default = "default_fail_sentinel")]
    pub fail_sentinel: String,
    #[serde(default = "default_true")]
    pub become_root: bool,
    // Falls back to login.new_password.
    pub sudo_password: Option<String>,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_suite_timeout_secs")]
    pub suite_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            share_dir: default_share_dir(),
            mount_tag: default_mount_tag(),
            mount_point: default_mount_point(),
            package: default_package(),
            command: default_command(),
            start_marker: default_start_marker(),
            pass_sentinel: default_pass_sentinel(),
            fail_sentinel: default_fail_sentinel(),
            become_root: true,
            sudo_password: None,
            install_timeout_secs: default_install_timeout_secs(),
            suite_timeout_secs: default_suite_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl RelayConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn suite_timeout(&self) -> Duration {
        Duration::from_secs(self.suite_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, sentinel) in [
            ("relay.pass_sentinel", &self.pass_sentinel),
            ("relay.fail_sentinel", &self.fail_sentinel),
        ] {
            if sentinel.len() < 2 {
                return Err(Error::msg(format!(
                    "{name} must be at least two characters"
                )));
            }
            if !sentinel
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '\'' && c != '"' && c != '\\')
            {
                return Err(Error::msg(format!(
                    "{name} '{sentinel}' must be printable ASCII without quotes or backslashes"
                )));
            }
        }
        if self.pass_sentinel.contains(&self.fail_sentinel)
            || self.fail_sentinel.contains(&self.pass_sentinel)
        {
            return Err(Error::msg(
                "relay.pass_sentinel and relay.fail_sentinel must not contain one another",
            ));
        }
        let tag = self.mount_tag.trim();
        if tag.is_empty() || tag.contains(',') || tag.contains(char::is_whitespace) {
            return Err(Error::msg(format!(
                "relay.mount_tag '{}' is invalid (must be non-empty, no commas or spaces)",
                self.mount_tag
            )));
        }
        if self.start_marker.trim().is_empty() {
            return Err(Error::msg("relay.start_marker is empty"));
        }
        if self.command.trim().is_empty() {
            return Err(Error::msg("relay.command is empty"));
        }
        Ok(())
    }
}

/// Everything a verification session needs, resolved once and passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub vm: VmConfig,
    pub login: LoginConfig,
    pub relay: RelayConfig,
    /// Raw console transcript destination.
    pub transcript: Option<String>,
}

impl HarnessConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: HarnessConfig = doc.deserialize_path("")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vm.memory_mb == 0 {
            return Err(Error::msg("vm.memory_mb must be > 0"));
        }
        if self.vm.image.trim().is_empty() {
            return Err(Error::msg("vm.image is empty"));
        }
        if self.relay.enabled {
            self.relay.validate()?;
        }
        Ok(())
    }

    pub fn sudo_password(&self) -> &str {
        self.relay
            .sudo_password
            .as_deref()
            .unwrap_or(&self.login.new_password)
    }
}
