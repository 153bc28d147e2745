//! URL & Name Builder (C3): maps `(version, os, arch, distro, release)` to
//! an archive URL and canonical binary filename.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PlatformError, VersionError};
use crate::platform::OsDescriptor;
use crate::types::{BinaryRequest, CoercedVersion};

const DEFAULT_MIRROR: &str = "https://dl.min.io/server/minio/release";

static LATEST_SENTINEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v\d+\.\d+-latest$").unwrap());

pub fn is_always_latest_pattern(raw: &str) -> bool {
    LATEST_SENTINEL.is_match(raw)
}

/// `archive_url(req) -> URL`.
pub fn archive_url(
    req: &BinaryRequest,
    download_url_override: Option<&str>,
    mirror: Option<&str>,
) -> Result<String, PlatformError> {
    if let Some(explicit) = download_url_override {
        return validate_url(explicit).map(str::to_string);
    }

    let platform = translate_platform(&req.os.os, &req.version)?;
    let arch = translate_arch(&req.arch, &platform)?;
    let mirror = mirror.unwrap_or(DEFAULT_MIRROR);
    Ok(format!(
        "{mirror}/{platform}-{arch}/archive/{version}",
        version = req.version
    ))
}

fn validate_url(url: &str) -> Result<&str, PlatformError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url)
    } else {
        Err(PlatformError::UnknownPlatform(format!(
            "invalid download URL: {url}"
        )))
    }
}

/// `archive_name(req) -> string`, used only when `USE_ARCHIVE_NAME_FOR_BINARY_NAME`
/// is true or `ARCHIVE_NAME` is explicitly set.
pub fn archive_name(req: &BinaryRequest, explicit: Option<&str>) -> Result<String, PlatformError> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    let platform = translate_platform(&req.os.os, &req.version)?;
    let arch = translate_arch(&req.arch, &platform)?;
    Ok(format!("{platform}-{arch}"))
}

/// `binary_name(req) -> string`: default form
/// `minio-<arch>-<distro-or-os>-<version>[.exe]`, legacy naming kept for
/// cache-path compatibility. Otherwise the archive's stem with extension
/// stripped.
pub fn binary_name(
    req: &BinaryRequest,
    use_archive_name: bool,
    archive_name_override: Option<&str>,
) -> Result<String, VersionErrorOrPlatform> {
    if use_archive_name || archive_name_override.is_some() {
        let name = archive_name(req, archive_name_override)?;
        return Ok(strip_archive_extension(&name));
    }

    let version = CoercedVersion::coerce(&req.version)?;
    let distro_or_os = if req.os.os == "linux" {
        distro_family(&req.os, &version)?
    } else {
        req.os.os.clone()
    };
    let suffix = if cfg!(target_os = "windows") { ".exe" } else { "" };
    Ok(format!(
        "minio-{arch}-{distro_or_os}-{version}{suffix}",
        arch = req.arch,
        version = version.raw()
    ))
}

fn strip_archive_extension(name: &str) -> String {
    name.trim_end_matches(".tar.gz")
        .trim_end_matches(".tgz")
        .trim_end_matches(".zip")
        .to_string()
}

/// Wraps both error kinds `binary_name` can raise without forcing every
/// caller to match two separate error types.
#[derive(Debug, thiserror::Error)]
pub enum VersionErrorOrPlatform {
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Platform translation: `darwin→darwin`; `win32→"windows"` if version ≥
/// 4.3.0 else `"win32"`; `linux`/`elementary OS→linux`; anything else fails.
pub fn translate_platform(os: &str, version: &str) -> Result<String, PlatformError> {
    match os.to_ascii_lowercase().as_str() {
        "darwin" => Ok("darwin".to_string()),
        "win32" | "windows" => {
            let coerced = CoercedVersion::coerce(version)
                .map_err(|e| PlatformError::UnknownPlatform(e.to_string()))?;
            let is_modern = coerced
                .as_semver()
                .map(|v| *v >= semver::Version::new(4, 3, 0))
                .unwrap_or(true);
            Ok(if is_modern {
                "windows".to_string()
            } else {
                "win32".to_string()
            })
        }
        "linux" | "elementary os" => Ok("linux".to_string()),
        other => Err(PlatformError::UnknownPlatform(other.to_string())),
    }
}

/// Arch translation: `x64|amd64|x86_64→amd64`; `arm64→arm64`;
/// `aarch64→aarch64`; `ia32→i686` on linux, `i386` on windows; else fails.
pub fn translate_arch(arch: &str, platform: &str) -> Result<String, PlatformError> {
    match arch.to_ascii_lowercase().as_str() {
        "x64" | "amd64" | "x86_64" => Ok("amd64".to_string()),
        "arm64" => Ok("arm64".to_string()),
        "aarch64" => Ok("aarch64".to_string()),
        "ia32" => Ok(if platform == "linux" { "i686" } else { "i386" }.to_string()),
        other => Err(PlatformError::UnknownArchitecture(other.to_string())),
    }
}

/// Dynamic dispatch over distro family, replacing an if/else chain with a
/// table of (regex, mapper) pairs selected by first match over `distro` then
/// each `id_like` entry, preserving the fallback order from spec.md §4.3.
type DistroMapper = fn(&OsDescriptor, &CoercedVersion) -> Result<String, VersionError>;

static DISTRO_FAMILIES: Lazy<Vec<(Regex, DistroMapper)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)ubuntu").unwrap(), map_ubuntu as DistroMapper),
        (Regex::new(r"(?i)amzn").unwrap(), map_amazon as DistroMapper),
        (Regex::new(r"(?i)suse").unwrap(), map_suse as DistroMapper),
        (
            Regex::new(r"(?i)rhel|centos|scientific|^ol$").unwrap(),
            map_rhel as DistroMapper,
        ),
        (Regex::new(r"(?i)fedora").unwrap(), map_fedora as DistroMapper),
        (Regex::new(r"(?i)debian").unwrap(), map_debian as DistroMapper),
        (Regex::new(r"(?i)alpine").unwrap(), map_alpine as DistroMapper),
        (
            Regex::new(r"(?i)arch|manjaro|arco").unwrap(),
            map_arch_fallback_ubuntu as DistroMapper,
        ),
        (Regex::new(r"(?i)gentoo").unwrap(), map_gentoo_fallback_debian as DistroMapper),
    ]
});

/// Linux distro string: dispatch on regex over `distro` and each `id_like`
/// entry, first match wins.
pub fn distro_family(os: &OsDescriptor, version: &CoercedVersion) -> Result<String, VersionError> {
    let candidates: Vec<&str> = std::iter::once(os.distro.as_deref().unwrap_or("unknown"))
        .chain(os.id_like.iter().map(String::as_str))
        .collect();

    for candidate in &candidates {
        if candidate.eq_ignore_ascii_case("unknown") {
            tracing::warn!("distro reported as unknown; using legacy empty string");
            return Ok(String::new());
        }
        for (pattern, mapper) in DISTRO_FAMILIES.iter() {
            if pattern.is_match(candidate) {
                return mapper(os, version);
            }
        }
    }

    tracing::warn!(distro = ?os.distro, "unrecognized distro family; using legacy empty string");
    Ok(String::new())
}

fn release_as_f64(os: &OsDescriptor) -> Option<f64> {
    os.release.as_deref().and_then(|r| r.parse::<f64>().ok())
}

fn map_ubuntu(os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    let release = release_as_f64(os).unwrap_or(22.04);
    Ok(format!("ubuntu{:.2}", release.max(18.04)))
}

fn map_amazon(_os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    Ok("amazon2".to_string())
}

fn map_suse(_os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    Ok("suse15".to_string())
}

fn map_rhel(os: &OsDescriptor, version: &CoercedVersion) -> Result<String, VersionError> {
    let release = release_as_f64(os).unwrap_or(8.2);
    let is_arm64 = os.os == "linux" && std::env::consts::ARCH == "aarch64";
    if is_arm64 && !version.suppress_lower_bound_checks() {
        if release < 8.2 {
            return Err(VersionError::KnownVersionIncompatibility {
                binary: "minio".to_string(),
                version: version.raw(),
                platform: format!("rhel{release}"),
                reason: "ARM64 builds require RHEL >= 8.2".to_string(),
            });
        }
        let below_min_version = version
            .as_semver()
            .map(|v| *v < semver::Version::new(4, 4, 2))
            .unwrap_or(false);
        if below_min_version {
            return Err(VersionError::KnownVersionIncompatibility {
                binary: "minio".to_string(),
                version: version.raw(),
                platform: format!("rhel{release}"),
                reason: "ARM64 builds require version >= 4.4.2".to_string(),
            });
        }
    }
    Ok(format!("rhel{:.0}", release.max(7.0)))
}

fn map_fedora(_os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    Ok("fedora".to_string())
}

fn map_debian(os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    let release = release_as_f64(os).unwrap_or(11.0);
    Ok(format!("debian{:.0}", release.max(9.0)))
}

fn map_alpine(_os: &OsDescriptor, _version: &CoercedVersion) -> Result<String, VersionError> {
    tracing::warn!("alpine is an unsupported distro family; using alpine mapping best-effort");
    Ok("alpine".to_string())
}

fn map_arch_fallback_ubuntu(
    os: &OsDescriptor,
    version: &CoercedVersion,
) -> Result<String, VersionError> {
    let synthetic = OsDescriptor {
        release: Some("22.04".to_string()),
        ..os.clone()
    };
    map_ubuntu(&synthetic, version)
}

fn map_gentoo_fallback_debian(
    os: &OsDescriptor,
    version: &CoercedVersion,
) -> Result<String, VersionError> {
    let synthetic = OsDescriptor {
        release: Some("11".to_string()),
        ..os.clone()
    };
    map_debian(&synthetic, version)
}
