//! Source-package license summary from a Syft JSON SBOM of the image rootfs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyftDoc {
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Artifact {
    pub metadata: ArtifactMetadata,
    pub licenses: Vec<LicenseEntry>,
    pub locations: Vec<Location>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactMetadata {
    pub package: Option<String>,
    pub source: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "sourceVersion")]
    pub source_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LicenseEntry {
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Location {
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourcePackage {
    pub source: String,
    pub version: Option<String>,
    pub binaries: BTreeSet<String>,
    pub licenses: BTreeSet<String>,
    /// binary package -> copyright file path inside the rootfs
    pub copyrights: BTreeMap<String, String>,
}

pub fn load(path: &Path) -> Result<SyftDoc> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::msg(format!("invalid Syft JSON in {}: {e}", path.display())))
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Group artifacts by Debian source package, in order of first appearance.
pub fn group_by_source(doc: &SyftDoc) -> Vec<SourcePackage> {
    let mut out: Vec<SourcePackage> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for artifact in &doc.artifacts {
        let md = &artifact.metadata;
        let binary = non_empty(&md.package).unwrap_or("unknown").to_string();
        let source = non_empty(&md.source).unwrap_or(&binary).to_string();
        let version = non_empty(&md.source_version)
            .or_else(|| non_empty(&md.version))
            .map(ToOwned::to_owned);

        let slot = *index.entry(source.clone()).or_insert_with(|| {
            out.push(SourcePackage {
                source: source.clone(),
                ..SourcePackage::default()
            });
            out.len() - 1
        });
        let group = &mut out[slot];

        group.binaries.insert(binary.clone());
        // Last artifact wins.
        group.version = version;
        for lic in &artifact.licenses {
            group
                .licenses
                .insert(non_empty(&lic.value).unwrap_or("unknown").to_string());
        }
        for loc in &artifact.locations {
            if let Some(path) = non_empty(&loc.path)
                && path.contains("copyright")
            {
                group.copyrights.insert(binary.clone(), path.to_string());
            }
        }
    }
    out
}

fn sha256_of_file(path: &Path) -> String {
    match fs::read(path) {
        Ok(data) => hex::encode(Sha256::digest(&data)),
        Err(_) => "unreadable".into(),
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// `source,version,binaries,licenses,copyright_sha256`, one row per source package.
pub fn render_csv(groups: &[SourcePackage], rootfs: &Path) -> String {
    let mut out = String::from("source,version,binaries,licenses,copyright_sha256\n");
    for g in groups {
        let hashes: BTreeSet<String> = g
            .copyrights
            .values()
            .map(|p| sha256_of_file(&rootfs.join(p.trim_start_matches('/'))))
            .collect();
        let row = [
            g.source.clone(),
            g.version.clone().unwrap_or_else(|| "unknown".into()),
            g.binaries.iter().cloned().collect::<Vec<_>>().join(" "),
            g.licenses.iter().cloned().collect::<Vec<_>>().join(" "),
            hashes.into_iter().collect::<Vec<_>>().join(" "),
        ];
        let row: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SBOM: &str = r#"{
      "artifacts": [
        {
          "metadata": {"package": "libc6", "source": "glibc", "version": "2.41-6", "sourceVersion": "2.41-6"},
          "licenses": [{"value": "LGPL-2.1"}, {"value": "GPL-2"}],
          "locations": [{"path": "/usr/share/doc/libc6/copyright"}, {"path": "/var/lib/dpkg/status"}]
        },
        {
          "metadata": {"package": "bash", "version": "5.2.37-1"},
          "licenses": [{}],
          "locations": [{"path": "/usr/share/doc/bash/copyright"}]
        },
        {
          "metadata": {"package": "libc-bin", "source": "glibc", "version": "2.41-6"},
          "licenses": [{"value": "GPL-2"}],
          "locations": []
        }
      ]
    }"#;

    #[test]
    fn groups_binaries_under_source_in_first_seen_order() {
        let doc: SyftDoc = serde_json::from_str(SBOM).expect("json");
        let groups = group_by_source(&doc);
        assert_eq!(
            groups.iter().map(|g| g.source.as_str()).collect::<Vec<_>>(),
            ["glibc", "bash"]
        );
        let glibc = &groups[0];
        assert_eq!(
            glibc.binaries.iter().map(String::as_str).collect::<Vec<_>>(),
            ["libc-bin", "libc6"]
        );
        assert_eq!(
            glibc.licenses.iter().map(String::as_str).collect::<Vec<_>>(),
            ["GPL-2", "LGPL-2.1"]
        );
        assert_eq!(glibc.copyrights.len(), 1);
        assert_eq!(groups[1].licenses.iter().next().map(String::as_str), Some("unknown"));
        assert_eq!(groups[1].version.as_deref(), Some("5.2.37-1"));
    }

    #[test]
    fn csv_hashes_copyright_files_in_rootfs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc_dir = tmp.path().join("usr/share/doc/libc6");
        fs::create_dir_all(&doc_dir).expect("mkdir");
        fs::write(doc_dir.join("copyright"), b"abc").expect("write");

        let doc: SyftDoc = serde_json::from_str(SBOM).expect("json");
        let csv = render_csv(&group_by_source(&doc), tmp.path());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "source,version,binaries,licenses,copyright_sha256");
        assert_eq!(
            lines[1],
            "glibc,2.41-6,libc-bin libc6,GPL-2 LGPL-2.1,\
             ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(lines[2], "bash,5.2.37-1,bash,unknown,unreadable");
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        assert_eq!(csv_field("GPL-2+, LGPL"), "\"GPL-2+, LGPL\"");
        assert_eq!(csv_field("MIT"), "MIT");
    }
}
