use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use deb_image_ci::console::Cancel;
use deb_image_ci::{Error, ErrorKind, Result};
use deb_image_ci::config::{self, ConfigDoc, HarnessConfig, StorageType};
use deb_image_ci::firmware::{self, CheckOptions, HttpRemote, Patterns};
use deb_image_ci::kernel_config::{self, DebTools, KernelConfigOptions};
use deb_image_ci::launcher::{self, LaunchOptions};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log output format (filter with RUST_LOG, default "info")
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Boot the image under qemu, do the first-login password reset, and run the guest test suite
    Test {
        /// Harness config TOML
        #[arg(long)]
        config: Option<PathBuf>,
        /// Base disk image (overrides vm.image)
        #[arg(long)]
        image: Option<PathBuf>,
        /// Storage type; decides the sector size (overrides vm.storage)
        #[arg(long, value_enum)]
        storage: Option<StorageType>,
        /// Host directory shared into the guest (overrides relay.share_dir)
        #[arg(long)]
        share: Option<PathBuf>,
        /// Write the raw console transcript here (a directory gets a timestamped file)
        #[arg(long)]
        transcript: Option<PathBuf>,
        /// Stop after login
        #[arg(long)]
        skip_relay: bool,
    },
    /// Boot a disk image interactively, by default through a throwaway COW overlay
    Run {
        /// Harness config TOML (only [vm] is used)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Disk image; default is disk-ufs.img or disk-sdcard.img in the current directory
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long, value_enum)]
        storage: Option<StorageType>,
        /// Write to the image itself instead of an overlay
        #[arg(long)]
        no_cow: bool,
        /// No window; serial console and monitor on stdio
        #[arg(long)]
        headless: bool,
        /// Extra qemu arguments, e.g. --qemu-args "-smp 4 -m 4096"
        #[arg(long)]
        qemu_args: Option<String>,
    },
    /// Summarize a Syft JSON SBOM as CSV, one row per Debian source package
    LicenseSummary {
        /// Syft JSON file
        syft_json: PathBuf,
        /// Root filesystem the SBOM was generated from
        #[arg(long)]
        rootfs: PathBuf,
    },
    /// Download the image's kernel package into a private apt root and extract its boot/config-*
    KernelConfig {
        /// deb822 .sources file describing the image's apt repositories
        #[arg(long)]
        sources: PathBuf,
        /// Kernel metapackage; resolved to the versioned linux-image-* it depends on
        #[arg(long, default_value = "linux-image-arm64")]
        package: String,
        #[arg(long, default_value = kernel_config::DEFAULT_ARCH)]
        arch: String,
        /// Output file (default: the config-* name in the current directory)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Keep the apt root and downloaded package
        #[arg(long)]
        keep_workdir: bool,
    },
    /// Compare pinned boot firmware and CDT URLs in a flash recipe with the newest published ones
    FirmwareCheck {
        #[arg(long, default_value = firmware::DEFAULT_RECIPE)]
        recipe: PathBuf,
        #[arg(long)]
        boot_binaries: bool,
        #[arg(long)]
        cdt: bool,
        /// Only URLs mentioning one of these silicon families (implies --boot-binaries)
        #[arg(long, num_args = 1..)]
        silicons: Vec<String>,
        /// Compare against this boot binaries release instead of the newest listed
        #[arg(long)]
        boot_binaries_rev: Option<String>,
        /// Download upgraded artifacts and print their sha256
        #[arg(long)]
        update_checksums: bool,
    },
    /// Print the fully-resolved config TOML (after extends/imports)
    Resolve {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);

    let res = match args.cmd {
        Command::Test {
            config,
            image,
            storage,
            share,
            transcript,
            skip_relay,
        } => cmd_test(
            config.as_deref(),
            image,
            storage,
            share.as_deref(),
            transcript,
            skip_relay,
        )
        .map(|()| 0),
        Command::Run {
            config,
            image,
            storage,
            no_cow,
            headless,
            qemu_args,
        } => cmd_run(
            config.as_deref(),
            LaunchOptions {
                image,
                storage,
                no_cow,
                headless,
                qemu_args,
            },
        ),
        Command::LicenseSummary { syft_json, rootfs } => {
            cmd_license_summary(&syft_json, &rootfs).map(|()| 0)
        }
        Command::KernelConfig {
            sources,
            package,
            arch,
            output,
            keep_workdir,
        } => {
            let mut opts = KernelConfigOptions::new(sources);
            opts.package = package;
            opts.arch = arch;
            opts.output = output;
            opts.keep_workdir = keep_workdir;
            cmd_kernel_config(&opts).map(|()| 0)
        }
        Command::FirmwareCheck {
            recipe,
            boot_binaries,
            cdt,
            silicons,
            boot_binaries_rev,
            update_checksums,
        } => cmd_firmware_check(
            &recipe,
            CheckOptions {
                boot_binaries,
                cdt,
                silicons,
                boot_binaries_rev,
                update_checksums,
            },
        )
        .map(|()| 0),
        Command::Resolve { config } => cmd_resolve(&config).map(|()| 0),
    };

    match res {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) if e.kind() == ErrorKind::Interrupted => {
            tracing::error!("{e}");
            ExitCode::from(130)
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// SIGINT/SIGTERM/SIGHUP set the returned flag; a second signal exits at once.
fn install_signal_handler() -> Result<Cancel> {
    let cancel = Cancel::new();
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if flag.is_cancelled() {
            std::process::exit(130);
        }
        warn!("interrupted, shutting down the VM");
        flag.cancel();
    })
    .map_err(|e| Error::msg(format!("failed to install signal handler: {e}")))?;
    Ok(cancel)
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let doc = match path {
        Some(p) => config::load(p)?,
        None => ConfigDoc::empty(),
    };
    HarnessConfig::from_doc(&doc)
}

fn cmd_test(
    config: Option<&Path>,
    image: Option<PathBuf>,
    storage: Option<StorageType>,
    share: Option<&Path>,
    transcript: Option<PathBuf>,
    skip_relay: bool,
) -> Result<()> {
    let mut cfg = load_config(config)?;
    if let Some(image) = image {
        cfg.vm.image = image.to_string_lossy().into_owned();
    }
    if storage.is_some() {
        cfg.vm.storage = storage;
    }
    if let Some(t) = transcript {
        cfg.transcript = Some(t.to_string_lossy().into_owned());
    }
    if skip_relay {
        cfg.relay.enabled = false;
    }
    cfg.validate()?;
    let cancel = install_signal_handler()?;
    deb_image_ci::session::run_verification(&cfg, share, &cancel)
}

fn cmd_run(config: Option<&Path>, opts: LaunchOptions) -> Result<i32> {
    let cfg = load_config(config)?;
    let cancel = install_signal_handler()?;
    launcher::launch(&cfg.vm, &opts, &cancel)
}

fn cmd_license_summary(syft_json: &Path, rootfs: &Path) -> Result<()> {
    let doc = deb_image_ci::license::load(syft_json)?;
    let groups = deb_image_ci::license::group_by_source(&doc);
    print!("{}", deb_image_ci::license::render_csv(&groups, rootfs));
    Ok(())
}

fn cmd_kernel_config(opts: &KernelConfigOptions) -> Result<()> {
    let path = kernel_config::fetch_kernel_config(&DebTools::default(), opts)?;
    println!("wrote: {}", path.display());
    Ok(())
}

fn cmd_firmware_check(recipe: &Path, opts: CheckOptions) -> Result<()> {
    let text = std::fs::read_to_string(recipe)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", recipe.display())))?;
    let patterns = Patterns::new()?;
    let remote = HttpRemote::new(&patterns)?;
    let findings = firmware::check_recipe(&text, &opts.normalized(), &patterns, &remote);
    if findings.is_empty() {
        warn!("no matching artifact URLs in {}", recipe.display());
    }
    print!("{}", firmware::render_report(&findings));
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render {}: {e}", path.display())))?;
    print!("{s}");
    Ok(())
}
