//! Upgrade checks for the boot firmware and CDT blobs pinned in the flash recipe.
//!
//! Every `"url"` entry of the recipe is classified by host/path layout. Boot
//! binaries carry their release as a directory (`.../r1.0_00116.0/...`); CDT
//! blobs sit flat in a `cdt/` directory. The newest entry of the matching
//! directory listing is compared with the pinned one.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_RECIPE: &str = "debos-recipes/qualcomm-linux-debian-flash.yaml";

const BOOT_BINARIES_URL: &str = r"^(https://softwarecenter\.qualcomm\.com/download/software/chip/qualcomm_linux-spf-1-0/qualcomm-linux-spf-1-0_test_device_public)/(r[0-9]+\.[0-9]+_[0-9]+\.[0-9]+)/(.*)$";
const CDT_URL: &str = r"^(https://artifacts\.codelinaro\.org/artifactory/codelinaro-le)/(Qualcomm_Linux/.*)/(cdt)/(.*)$";
const BOOT_RELEASE: &str = r"^r[0-9]+\.[0-9]+_[0-9]+\.[0-9]+";
const QUOTED_URL: &str = r#""(https?://[^"]+)""#;
const HREF: &str = r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']*)["']"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    BootBinaries,
    Cdt,
}

impl ArtifactKind {
    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::BootBinaries => "Boot Binaries",
            ArtifactKind::Cdt => "CDT",
        }
    }
}

/// A pinned artifact URL and where to look for newer ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub url: String,
    /// Directory listing that holds the candidates.
    pub listing_url: String,
    /// Release directory (boot binaries) or file name (CDT).
    pub current: String,
    // Path below the release directory; empty for CDT.
    suffix: String,
    base: String,
}

impl Artifact {
    pub fn url_for(&self, item: &str) -> String {
        match self.kind {
            ArtifactKind::BootBinaries => format!("{}/{item}/{}", self.base, self.suffix),
            ArtifactKind::Cdt => format!("{}{item}", self.listing_url),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub boot_binaries: bool,
    pub cdt: bool,
    /// Only URLs mentioning one of these (case-insensitive).
    pub silicons: Vec<String>,
    /// Compare boot binaries against this release instead of the newest listed.
    pub boot_binaries_rev: Option<String>,
    pub update_checksums: bool,
}

impl CheckOptions {
    /// Silicon filtering implies boot binaries; no selection at all means both kinds.
    pub fn normalized(mut self) -> Self {
        if !self.silicons.is_empty() {
            self.boot_binaries = true;
        }
        if !self.boot_binaries && !self.cdt {
            self.boot_binaries = true;
            self.cdt = true;
        }
        self
    }
}

pub struct Patterns {
    boot: Regex,
    cdt: Regex,
    boot_release: Regex,
    quoted_url: Regex,
    href: Regex,
}

impl Patterns {
    pub fn new() -> Result<Self> {
        let compile = |re: &str| {
            Regex::new(re).map_err(|e| Error::msg(format!("invalid pattern {re}: {e}")))
        };
        Ok(Self {
            boot: compile(BOOT_BINARIES_URL)?,
            cdt: compile(CDT_URL)?,
            boot_release: compile(BOOT_RELEASE)?,
            quoted_url: compile(QUOTED_URL)?,
            href: compile(HREF)?,
        })
    }

    fn classify(&self, url: &str, opts: &CheckOptions) -> Option<Artifact> {
        let mut found = None;
        if opts.boot_binaries
            && let Some(c) = self.boot.captures(url)
        {
            found = Some(Artifact {
                kind: ArtifactKind::BootBinaries,
                url: url.to_string(),
                listing_url: format!("{}/", &c[1]),
                current: c[2].to_string(),
                suffix: c[3].to_string(),
                base: c[1].to_string(),
            });
        }
        if opts.cdt
            && let Some(c) = self.cdt.captures(url)
        {
            found = Some(Artifact {
                kind: ArtifactKind::Cdt,
                url: url.to_string(),
                listing_url: format!("{}/{}/{}/", &c[1], &c[2], &c[3]),
                current: c[4].to_string(),
                suffix: String::new(),
                base: c[1].to_string(),
            });
        }
        found
    }
}

/// Pinned artifacts in recipe order.
pub fn scan_recipe(text: &str, opts: &CheckOptions, patterns: &Patterns) -> Vec<Artifact> {
    let silicons: Vec<String> = opts.silicons.iter().map(|s| s.to_lowercase()).collect();
    text.lines()
        .filter_map(|line| line.split_once("\"url\"").map(|(_, rest)| rest))
        .filter_map(|rest| patterns.quoted_url.captures(rest).map(|c| c[1].to_string()))
        .filter(|url| {
            let lower = url.to_lowercase();
            silicons.is_empty() || silicons.iter().any(|s| lower.contains(s))
        })
        .filter_map(|url| patterns.classify(&url, opts))
        .collect()
}

/// `href` targets of every anchor in an HTML page.
pub fn extract_links(html: &str, patterns: &Patterns) -> Vec<String> {
    patterns
        .href
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}

// Release directories sort numerically; anything unparsable sorts after them by name.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ReleaseKey {
    Numeric(Vec<u64>),
    Text(String),
}

fn release_key(v: &str) -> ReleaseKey {
    let parsed = v
        .strip_prefix('r')
        .and_then(|rest| rest.split_once('_'))
        .and_then(|(major, minor)| {
            major
                .split('.')
                .chain(minor.split('.'))
                .map(|n| n.parse::<u64>().ok())
                .collect::<Option<Vec<_>>>()
        });
    match parsed {
        Some(parts) => ReleaseKey::Numeric(parts),
        None => ReleaseKey::Text(v.to_string()),
    }
}

/// Newest listing entry for `kind`, skipping the parent link.
pub fn latest_item(links: &[String], kind: ArtifactKind, patterns: &Patterns) -> Option<String> {
    let items = links
        .iter()
        .map(|l| l.trim_end_matches('/'))
        .filter(|l| !l.is_empty() && *l != "..")
        .filter(|l| kind == ArtifactKind::Cdt || patterns.boot_release.is_match(l));
    match kind {
        ArtifactKind::BootBinaries => items.max_by(|a, b| cmp_release(a, b)),
        ArtifactKind::Cdt => items.max(),
    }
    .map(str::to_string)
}

fn cmp_release(a: &str, b: &str) -> Ordering {
    release_key(a).cmp(&release_key(b))
}

/// Where listings and blobs come from.
pub trait Remote {
    fn links(&self, url: &str) -> Result<Vec<String>>;
    fn sha256(&self, url: &str) -> Result<String>;
}

pub struct HttpRemote<'a> {
    client: reqwest::blocking::Client,
    patterns: &'a Patterns,
}

impl<'a> HttpRemote<'a> {
    pub fn new(patterns: &'a Patterns) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, patterns })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::msg(format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }
        Ok(res)
    }
}

impl Remote for HttpRemote<'_> {
    fn links(&self, url: &str) -> Result<Vec<String>> {
        let html = self
            .get(url)?
            .text()
            .map_err(|e| Error::msg(format!("failed to read {url}: {e}")))?;
        Ok(extract_links(&html, self.patterns))
    }

    fn sha256(&self, url: &str) -> Result<String> {
        info!("downloading {url}");
        let mut res = self.get(url)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut res, &mut hasher)
            .map_err(|e| Error::msg(format!("download of {url} failed: {e}")))?;
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub artifact: Artifact,
    /// `None` when the listing could not be fetched or was empty.
    pub latest: Option<String>,
    /// Set when `latest` differs from the pinned item.
    pub new_url: Option<String>,
    pub sha256: Option<String>,
}

impl Finding {
    pub fn upgrade_available(&self) -> bool {
        self.new_url.is_some()
    }
}

/// Check every pinned artifact of `recipe`. Listing and download failures are
/// logged and leave the finding without a result; they do not abort the run.
pub fn check_recipe(
    recipe: &str,
    opts: &CheckOptions,
    patterns: &Patterns,
    remote: &dyn Remote,
) -> Vec<Finding> {
    // A listing directory is fetched once per run.
    let mut listings: HashMap<String, Option<Vec<String>>> = HashMap::new();
    let mut findings = Vec::new();

    for artifact in scan_recipe(recipe, opts, patterns) {
        info!("{} artifact: {}", artifact.kind.label(), artifact.url);
        let latest = match (&opts.boot_binaries_rev, artifact.kind) {
            (Some(rev), ArtifactKind::BootBinaries) => Some(rev.clone()),
            _ => listings
                .entry(artifact.listing_url.clone())
                .or_insert_with(|| match remote.links(&artifact.listing_url) {
                    Ok(links) => Some(links),
                    Err(e) => {
                        warn!("{e}");
                        None
                    }
                })
                .as_deref()
                .and_then(|links| latest_item(links, artifact.kind, patterns)),
        };

        let new_url = latest
            .as_deref()
            .filter(|l| *l != artifact.current)
            .map(|l| artifact.url_for(l));
        let sha256 = match &new_url {
            Some(url) if opts.update_checksums => match remote.sha256(url) {
                Ok(sum) => Some(sum),
                Err(e) => {
                    warn!("checksum of {url}: {e}");
                    None
                }
            },
            _ => None,
        };
        findings.push(Finding {
            artifact,
            latest,
            new_url,
            sha256,
        });
    }
    findings
}

pub fn render_report(findings: &[Finding]) -> String {
    let mut out = String::new();
    for f in findings {
        let _ = writeln!(out, "Found {} artifact: {}", f.artifact.kind.label(), f.artifact.url);
        let _ = writeln!(out, "  Current: {}", f.artifact.current);
        match (&f.latest, &f.new_url) {
            (Some(latest), Some(url)) => {
                let _ = writeln!(out, "  ** New version available: {latest} **");
                let _ = writeln!(out, "  New URL: {url}");
                if let Some(sum) = &f.sha256 {
                    let _ = writeln!(out, "  SHA256: {sum}");
                }
            }
            (None, _) => {
                let _ = writeln!(out, "  Unknown (listing unavailable).");
            }
            (Some(_), None) => {
                let _ = writeln!(out, "  Up to date.");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const BOOT: &str = "https://softwarecenter.qualcomm.com/download/software/chip/qualcomm_linux-spf-1-0/qualcomm-linux-spf-1-0_test_device_public";
    const CDT_DIR: &str = "https://artifacts.codelinaro.org/artifactory/codelinaro-le/Qualcomm_Linux/QCS6490/cdt/";

    fn recipe() -> String {
        format!(
            r#"actions:
  - action: download
    description: rb3gen2 boot binaries
    "url" : "{BOOT}/r1.0_00090.0/QCS6490.LE.1.0/common/build/ufs/bin/QCS6490_bootbinaries.zip"
  - action: download
    "url": "{BOOT}/r1.0_00090.0/QCS9100.LE.1.0/common/build/ufs/bin/QCS9100_bootbinaries.zip"
  - action: download
    "url": "{CDT_DIR}rb3gen2-core-kit_1.0.zip"
    "sha256": "0000"
  - action: run
    command: echo "url" unrelated
"#
        )
    }

    #[derive(Default)]
    struct FakeRemote {
        listings: HashMap<String, Vec<String>>,
        fetched: RefCell<Vec<String>>,
    }

    impl Remote for FakeRemote {
        fn links(&self, url: &str) -> Result<Vec<String>> {
            self.fetched.borrow_mut().push(url.to_string());
            self.listings
                .get(url)
                .cloned()
                .ok_or_else(|| Error::msg(format!("GET {url} failed with status 404")))
        }

        fn sha256(&self, url: &str) -> Result<String> {
            Ok(hex::encode(Sha256::digest(url.as_bytes())))
        }
    }

    fn links(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recipe_urls_are_classified() {
        let p = Patterns::new().expect("patterns");
        let found = scan_recipe(&recipe(), &CheckOptions::default().normalized(), &p);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].kind, ArtifactKind::BootBinaries);
        assert_eq!(found[0].current, "r1.0_00090.0");
        assert_eq!(found[0].listing_url, format!("{BOOT}/"));
        assert_eq!(found[2].kind, ArtifactKind::Cdt);
        assert_eq!(found[2].current, "rb3gen2-core-kit_1.0.zip");
        assert_eq!(found[2].listing_url, CDT_DIR);
        assert_eq!(
            found[0].url_for("r1.0_00116.0"),
            format!("{BOOT}/r1.0_00116.0/QCS6490.LE.1.0/common/build/ufs/bin/QCS6490_bootbinaries.zip")
        );
    }

    #[test]
    fn option_normalization_and_silicon_filter() {
        let p = Patterns::new().expect("patterns");
        let opts = CheckOptions {
            silicons: vec!["qcs9100".into()],
            ..CheckOptions::default()
        }
        .normalized();
        assert!(opts.boot_binaries && !opts.cdt);
        let found = scan_recipe(&recipe(), &opts, &p);
        assert_eq!(found.len(), 1);
        assert!(found[0].url.contains("QCS9100"));

        let cdt_only = CheckOptions {
            cdt: true,
            ..CheckOptions::default()
        }
        .normalized();
        assert!(!cdt_only.boot_binaries);
        assert_eq!(scan_recipe(&recipe(), &cdt_only, &p).len(), 1);
    }

    #[test]
    fn releases_sort_numerically() {
        let p = Patterns::new().expect("patterns");
        let listing = links(&["../", "r1.0_00090.0/", "r1.0_00116.0/", "r1.0_00099.1/", "README"]);
        assert_eq!(
            latest_item(&listing, ArtifactKind::BootBinaries, &p).as_deref(),
            Some("r1.0_00116.0")
        );
        let listing = links(&["r1.0_9.0/", "r1.0_10.0/"]);
        assert_eq!(
            latest_item(&listing, ArtifactKind::BootBinaries, &p).as_deref(),
            Some("r1.0_10.0")
        );
        assert_eq!(latest_item(&links(&["../"]), ArtifactKind::Cdt, &p), None);
    }

    #[test]
    fn links_come_from_anchor_hrefs() {
        let p = Patterns::new().expect("patterns");
        let html = r#"<html><body><a href="../">../</a>
<A class="x" HREF='r1.0_00116.0/'>r1.0_00116.0/</A><img src="a.png"></body></html>"#;
        assert_eq!(extract_links(html, &p), links(&["../", "r1.0_00116.0/"]));
    }

    #[test]
    fn check_reports_upgrades_and_listing_failures() {
        let p = Patterns::new().expect("patterns");
        let mut remote = FakeRemote::default();
        remote.listings.insert(
            format!("{BOOT}/"),
            links(&["../", "r1.0_00090.0/", "r1.0_00116.0/"]),
        );
        let opts = CheckOptions {
            update_checksums: true,
            ..CheckOptions::default()
        }
        .normalized();

        let findings = check_recipe(&recipe(), &opts, &p, &remote);
        assert_eq!(findings.len(), 3);
        // Both boot artifacts share one listing.
        assert_eq!(remote.fetched.borrow().len(), 2);

        assert!(findings[0].upgrade_available());
        assert_eq!(findings[0].latest.as_deref(), Some("r1.0_00116.0"));
        assert!(findings[0].sha256.as_ref().is_some_and(|s| s.len() == 64));
        assert_eq!(findings[2].latest, None);
        assert!(!findings[2].upgrade_available());

        let report = render_report(&findings);
        assert!(report.contains("** New version available: r1.0_00116.0 **"), "{report}");
        assert!(report.contains("Unknown (listing unavailable)."), "{report}");
    }

    #[test]
    fn pinned_revision_skips_listing() {
        let p = Patterns::new().expect("patterns");
        let remote = FakeRemote::default();
        let opts = CheckOptions {
            boot_binaries: true,
            boot_binaries_rev: Some("r1.0_00090.0".into()),
            ..CheckOptions::default()
        }
        .normalized();

        let findings = check_recipe(&recipe(), &opts, &p, &remote);
        assert_eq!(findings.len(), 2);
        assert!(remote.fetched.borrow().is_empty());
        assert!(findings.iter().all(|f| !f.upgrade_available()));
        assert!(render_report(&findings).contains("Up to date."));
    }
}
