//! Pull the kernel `.config` out of a Debian `linux-image-*` package without touching
//! the host's apt state: a private apt root is populated from a deb822 sources file,
//! the metapackage is resolved to its versioned image package, and `boot/config-*`
//! is streamed out of the downloaded `.deb`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_ARCH: &str = "arm64";

#[derive(Debug, Clone)]
pub struct KernelConfigOptions {
    /// deb822 `.sources` file copied into the private apt root.
    pub sources: PathBuf,
    /// Package or metapackage, e.g. `linux-image-arm64`.
    pub package: String,
    pub arch: String,
    /// Default: `<resolved package>.config` in the current directory.
    pub output: Option<PathBuf>,
    /// Leave the work directory behind for inspection.
    pub keep_workdir: bool,
}

impl KernelConfigOptions {
    pub fn new(sources: impl Into<PathBuf>) -> Self {
        Self {
            sources: sources.into(),
            package: format!("linux-image-{DEFAULT_ARCH}"),
            arch: DEFAULT_ARCH.into(),
            output: None,
            keep_workdir: false,
        }
    }
}

/// Host programs used; overridable so tests can substitute scripts.
#[derive(Debug, Clone)]
pub struct DebTools {
    pub apt_get: PathBuf,
    pub apt_cache: PathBuf,
    pub dpkg_deb: PathBuf,
    pub tar: PathBuf,
}

impl Default for DebTools {
    fn default() -> Self {
        Self {
            apt_get: "apt-get".into(),
            apt_cache: "apt-cache".into(),
            dpkg_deb: "dpkg-deb".into(),
            tar: "tar".into(),
        }
    }
}

impl DebTools {
    pub fn check(&self) -> Result<()> {
        let missing: Vec<String> = [&self.apt_get, &self.apt_cache, &self.dpkg_deb, &self.tar]
            .into_iter()
            .filter(|p| which::which(p).is_err())
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::missing_dependency(format!(
            "missing host tools: {}\nOn Debian/Ubuntu: apt install apt dpkg tar",
            missing.join(", ")
        )))
    }
}

/// A throwaway apt `Dir=` root.
#[derive(Debug)]
pub struct AptRoot {
    root: PathBuf,
    arch: String,
}

impl AptRoot {
    /// Lay out `etc/apt/sources.list.d` and `var/lib/apt/lists/partial` under `root`
    /// and install `sources` as the only source.
    pub fn create(root: &Path, sources: &str, arch: &str) -> Result<Self> {
        let sources_d = root.join("etc/apt/sources.list.d");
        let lists = root.join("var/lib/apt/lists/partial");
        for dir in [&sources_d, &lists] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        }
        let path = sources_d.join("sources.sources");
        fs::write(&path, sources)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        Ok(Self {
            root: root.to_path_buf(),
            arch: arch.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `-o` options pointing apt at this root instead of the host's.
    pub fn options(&self) -> Vec<String> {
        [
            format!("Dir={}", self.root.display()),
            format!("APT::Architecture={}", self.arch),
            "Acquire::Languages=none".to_string(),
            "Debug::NoLocking=false".to_string(),
        ]
        .into_iter()
        .flat_map(|opt| ["-o".to_string(), opt])
        .collect()
    }
}

fn run(mut cmd: Command) -> Result<Output> {
    info!("running: {:?}", cmd);
    let out = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run {:?}: {e}", cmd.get_program())))?;
    if !out.status.success() {
        return Err(Error::msg(format!(
            "{:?} failed ({}): {}",
            cmd.get_program(),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(out)
}

pub fn apt_update(tools: &DebTools, root: &AptRoot) -> Result<()> {
    let mut cmd = Command::new(&tools.apt_get);
    cmd.args(root.options()).arg("update");
    run(cmd).map(|_| ())
}

/// Pick the versioned image package a metapackage depends on, preferring signed
/// images. A package with no `linux-image-*` dependency is taken as already specific.
pub fn pick_image_package(depends_output: &str, package: &str) -> String {
    let candidates: Vec<&str> = depends_output
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("Depends:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter(|dep| dep.starts_with("linux-image-"))
        .collect();
    candidates
        .iter()
        .find(|pkg| !pkg.contains("-unsigned-"))
        .or_else(|| candidates.first())
        .map_or_else(|| package.to_string(), |pkg| pkg.to_string())
}

pub fn resolve_image_package(tools: &DebTools, root: &AptRoot, package: &str) -> Result<String> {
    let mut cmd = Command::new(&tools.apt_cache);
    cmd.args(root.options()).args(["depends", package]);
    let out = run(cmd)?;
    Ok(pick_image_package(&String::from_utf8_lossy(&out.stdout), package))
}

/// Newest-named `.deb` for `pkg` in `dir`: `<pkg>_*.deb` first, then any `<pkg>*.deb`.
pub fn find_downloaded_deb(dir: &Path, pkg: &str) -> Result<PathBuf> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".deb"))
        .collect();
    names.sort();

    let exact = format!("{pkg}_");
    names
        .iter()
        .rfind(|n| n.starts_with(&exact))
        .or_else(|| names.iter().rfind(|n| n.starts_with(pkg)))
        .map(|n| dir.join(n))
        .ok_or_else(|| {
            Error::msg(format!(
                "download succeeded but no .deb for {pkg} in {}",
                dir.display()
            ))
        })
}

pub fn download(tools: &DebTools, root: &AptRoot, pkg: &str, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    let mut cmd = Command::new(&tools.apt_get);
    cmd.args(root.options()).args(["download", pkg]).current_dir(dir);
    run(cmd)?;
    find_downloaded_deb(dir, pkg)
}

/// First `./boot/config-*` member of a `tar -t` listing.
pub fn find_config_member(listing: &str) -> Option<&str> {
    listing
        .lines()
        .map(str::trim)
        .find(|p| p.starts_with("./boot/config-"))
}

// `dpkg-deb --fsys-tarfile <deb> | tar <tar_args>`, returning tar's stdout.
fn fsys_tar(tools: &DebTools, deb: &Path, tar_args: &[&str]) -> Result<Vec<u8>> {
    debug!(
        "running: {} --fsys-tarfile {} | {} {}",
        tools.dpkg_deb.display(),
        deb.display(),
        tools.tar.display(),
        tar_args.join(" ")
    );
    let mut dpkg = Command::new(&tools.dpkg_deb)
        .arg("--fsys-tarfile")
        .arg(deb)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to run {}: {e}", tools.dpkg_deb.display())))?;
    let Some(fsys) = dpkg.stdout.take() else {
        let _ = dpkg.kill();
        let _ = dpkg.wait();
        return Err(Error::msg("dpkg-deb stdout unavailable"));
    };

    let tar = Command::new(&tools.tar)
        .args(tar_args)
        .stdin(Stdio::from(fsys))
        .output();
    let dpkg_status = dpkg
        .wait()
        .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
    let tar = tar.map_err(|e| Error::msg(format!("failed to run {}: {e}", tools.tar.display())))?;

    if !dpkg_status.success() {
        return Err(Error::msg(format!(
            "dpkg-deb --fsys-tarfile {} failed ({dpkg_status})",
            deb.display()
        )));
    }
    if !tar.status.success() {
        return Err(Error::msg(format!(
            "tar {} failed ({}): {}",
            tar_args.join(" "),
            tar.status,
            String::from_utf8_lossy(&tar.stderr).trim()
        )));
    }
    Ok(tar.stdout)
}

/// Write the package's `boot/config-*` to `output`; returns the member name.
pub fn extract_config(tools: &DebTools, deb: &Path, output: &Path) -> Result<String> {
    let listing = fsys_tar(tools, deb, &["-t"])?;
    let listing = String::from_utf8_lossy(&listing);
    let member = find_config_member(&listing)
        .ok_or_else(|| Error::msg(format!("no ./boot/config-* in {}", deb.display())))?
        .to_string();
    info!("found {member} in {}", deb.display());

    let config = fsys_tar(tools, deb, &["-xO", &member])?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    fs::write(output, config)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", output.display())))?;
    Ok(member)
}

/// The whole flow; returns the path written.
pub fn fetch_kernel_config(tools: &DebTools, opts: &KernelConfigOptions) -> Result<PathBuf> {
    tools.check()?;
    let sources = fs::read_to_string(&opts.sources).map_err(|e| {
        Error::msg(format!(
            "failed to read sources file {}: {e}",
            opts.sources.display()
        ))
    })?;

    let work = tempfile::Builder::new()
        .prefix("kernel-config-")
        .tempdir()
        .map_err(|e| Error::msg(format!("failed to create work dir: {e}")))?;
    info!("isolated apt root in {}", work.path().display());
    let root = AptRoot::create(&work.path().join("aptroot"), &sources, &opts.arch)?;

    let res = fetch_in(tools, &root, opts, work.path());
    if opts.keep_workdir {
        let kept = work.keep();
        info!("kept work dir {}", kept.display());
    }
    res
}

fn fetch_in(tools: &DebTools, root: &AptRoot, opts: &KernelConfigOptions, work: &Path) -> Result<PathBuf> {
    apt_update(tools, root)?;
    let pkg = resolve_image_package(tools, root, &opts.package)?;
    info!("resolved kernel package: {pkg}");
    let deb = download(tools, root, &pkg, &work.join("downloads"))?;

    let output = match &opts.output {
        Some(p) => p.clone(),
        None => std::env::current_dir()
            .map_err(|e| Error::msg(format!("cwd error: {e}")))?
            .join(format!("{pkg}.config")),
    };
    extract_config(tools, &deb, &output)?;
    Ok(output)
}
