//! OS/Arch Probe (C2): classifies the host into `{os, distro, release}`.

use std::path::Path;
use std::sync::OnceLock;

use once_cell::sync::Lazy;
use regex::Regex;

/// Descriptor for the host operating system.
///
/// Invariant: `distro` is never `Some("unknown")` for a descriptor this
/// module hands back as "resolved" — callers needing the sentinel use
/// [`OsDescriptor::is_unknown_distro`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsDescriptor {
    pub os: String,
    pub distro: Option<String>,
    pub release: Option<String>,
    pub codename: Option<String>,
    pub id_like: Vec<String>,
}

impl OsDescriptor {
    fn host_only(os: &str) -> Self {
        OsDescriptor {
            os: os.to_string(),
            distro: None,
            release: None,
            codename: None,
            id_like: Vec::new(),
        }
    }

    pub fn is_unknown_distro(&self) -> bool {
        matches!(self.distro.as_deref(), None | Some("unknown"))
    }
}

static PROBE_RESULT: OnceLock<OsDescriptor> = OnceLock::new();

/// Probe the host. Memoized for the process lifetime.
pub fn probe() -> OsDescriptor {
    PROBE_RESULT.get_or_init(probe_uncached).clone()
}

fn probe_uncached() -> OsDescriptor {
    let host_os = host_os_name();
    if host_os != "linux" {
        return OsDescriptor::host_only(host_os);
    }

    const SOURCES: &[(&str, ReleaseFileFormat)] = &[
        ("/etc/upstream-release/lsb-release", ReleaseFileFormat::Lsb),
        ("/etc/os-release", ReleaseFileFormat::OsRelease),
        ("/usr/lib/os-release", ReleaseFileFormat::OsRelease),
        ("/etc/lsb-release", ReleaseFileFormat::Lsb),
    ];

    for (path, format) in SOURCES {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let descriptor = match format {
            ReleaseFileFormat::Lsb => parse_lsb(&content),
            ReleaseFileFormat::OsRelease => parse_os_release(&content),
        };
        if !descriptor.is_unknown_distro() {
            return descriptor;
        }
    }

    tracing::warn!("unable to determine Linux distro from any known release file; falling back to unknown");
    OsDescriptor {
        os: "linux".to_string(),
        distro: Some("unknown".to_string()),
        release: Some(String::new()),
        codename: None,
        id_like: Vec::new(),
    }
}

fn host_os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

enum ReleaseFileFormat {
    Lsb,
    OsRelease,
}

// File-style (`/etc/lsb-release`, `DISTRIB_ID=Ubuntu`) and command-style
// (`lsb_release -a` output, `Distributor ID:\tUbuntu`) both appear in the
// wild under the two source paths this module reads; both must match.
static LSB_DISTRIB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^distrib_id\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());
static LSB_DISTRIB_CODENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^distrib_codename\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());
static LSB_DISTRIB_RELEASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^distrib_release\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());

static LSB_CMD_DISTRIBUTOR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^distributor\s*id\s*:\s*(.+?)\s*$"#).unwrap());
static LSB_CMD_CODENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^codename\s*:\s*(.+?)\s*$"#).unwrap());
static LSB_CMD_RELEASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^release\s*:\s*(.+?)\s*$"#).unwrap());

fn parse_lsb(content: &str) -> OsDescriptor {
    let name = LSB_DISTRIB_ID
        .captures(content)
        .or_else(|| LSB_CMD_DISTRIBUTOR_ID.captures(content))
        .map(|c| c[1].trim().to_lowercase());
    let codename = LSB_DISTRIB_CODENAME
        .captures(content)
        .or_else(|| LSB_CMD_CODENAME.captures(content))
        .map(|c| c[1].trim().to_string());
    let release = LSB_DISTRIB_RELEASE
        .captures(content)
        .or_else(|| LSB_CMD_RELEASE.captures(content))
        .map(|c| c[1].trim().to_string());

    OsDescriptor {
        os: "linux".to_string(),
        distro: name.or(Some("unknown".to_string())),
        release,
        codename,
        id_like: Vec::new(),
    }
}

static OS_RELEASE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^id\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());
static OS_RELEASE_VERSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^version_id\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());
static OS_RELEASE_CODENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^version_codename\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());
static OS_RELEASE_ID_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^id_like\s*=\s*"?([^"\n]+)"?\s*$"#).unwrap());

fn parse_os_release(content: &str) -> OsDescriptor {
    let distro = OS_RELEASE_ID
        .captures(content)
        .map(|c| c[1].trim().to_lowercase());
    let release = OS_RELEASE_VERSION_ID
        .captures(content)
        .map(|c| c[1].trim().to_string());
    let codename = OS_RELEASE_CODENAME
        .captures(content)
        .map(|c| c[1].trim().to_string());
    let id_like = OS_RELEASE_ID_LIKE
        .captures(content)
        .map(|c| {
            c[1].trim()
                .split_whitespace()
                .map(|s| s.trim_matches('"').to_lowercase())
                .collect()
        })
        .unwrap_or_default();

    OsDescriptor {
        os: "linux".to_string(),
        distro: distro.or(Some("unknown".to_string())),
        release,
        codename,
        id_like,
    }
}

/// Parse an arbitrary release file's content, auto-detecting its format from
/// the filename. Exposed for callers that need to probe an arbitrary root
/// (e.g. a container rootfs) instead of the memoized host probe.
pub fn probe_release_file(path: &Path, content: &str) -> OsDescriptor {
    let is_lsb = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == "lsb-release")
        .unwrap_or(false);
    if is_lsb {
        parse_lsb(content)
    } else {
        parse_os_release(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release_ubuntu() {
        let content = r#"
NAME="Ubuntu"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
VERSION_ID="22.04"
VERSION_CODENAME=jammy
"#;
        let d = parse_os_release(content);
        assert_eq!(d.distro.as_deref(), Some("ubuntu"));
        assert_eq!(d.release.as_deref(), Some("22.04"));
        assert_eq!(d.codename.as_deref(), Some("jammy"));
        assert_eq!(d.id_like, vec!["debian"]);
        assert!(!d.is_unknown_distro());
    }

    #[test]
    fn test_parse_os_release_rhel_id_like() {
        let content = r#"
NAME="Rocky Linux"
ID="rocky"
ID_LIKE="rhel centos fedora"
VERSION_ID="8.9"
"#;
        let d = parse_os_release(content);
        assert_eq!(d.distro.as_deref(), Some("rocky"));
        assert_eq!(d.id_like, vec!["rhel", "centos", "fedora"]);
    }

    #[test]
    fn test_parse_os_release_missing_id_is_unknown() {
        let content = "NAME=\"Something\"\n";
        let d = parse_os_release(content);
        assert!(d.is_unknown_distro());
    }

    #[test]
    fn test_parse_lsb_file_style() {
        let content = "DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\nDISTRIB_CODENAME=jammy\nDISTRIB_DESCRIPTION=\"Ubuntu 22.04.3 LTS\"\n";
        let d = parse_lsb(content);
        assert_eq!(d.distro.as_deref(), Some("ubuntu"));
        assert_eq!(d.release.as_deref(), Some("22.04"));
        assert_eq!(d.codename.as_deref(), Some("jammy"));
    }

    #[test]
    fn test_probe_release_file_dispatches_on_filename() {
        let d = probe_release_file(
            Path::new("/etc/lsb-release"),
            "DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=20.04\n",
        );
        assert_eq!(d.distro.as_deref(), Some("ubuntu"));

        let d2 = probe_release_file(Path::new("/etc/os-release"), "ID=alpine\nVERSION_ID=3.19\n");
        assert_eq!(d2.distro.as_deref(), Some("alpine"));
    }

    #[test]
    fn test_host_only_descriptor_has_no_distro() {
        let d = OsDescriptor::host_only("darwin");
        assert_eq!(d.os, "darwin");
        assert!(d.distro.is_none());
        assert!(d.is_unknown_distro());
    }

    #[test]
    fn test_probe_memoizes() {
        let a = probe();
        let b = probe();
        assert_eq!(a, b);
    }
}
