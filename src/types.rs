//! Shared data model: the structs and enums every component (C3–C7) passes
//! around, kept as explicit collaborators rather than global state per §9
//! "Global/singleton state."

use std::path::PathBuf;

use semver::Version;

use crate::error::VersionError;
use crate::platform::OsDescriptor;

/// A version string coerced into a semver triple, or the `-latest` sentinel.
///
/// Invariant: `is_always_latest() == true` implies lower-bound version
/// checks in the distro-family tables are suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoercedVersion {
    Semver(Version),
    AlwaysLatest(String),
}

impl CoercedVersion {
    pub fn coerce(raw: &str) -> Result<Self, VersionError> {
        if crate::resolve::is_always_latest_pattern(raw) {
            return Ok(CoercedVersion::AlwaysLatest(raw.to_string()));
        }
        let cleaned = raw.trim_start_matches('v');
        if let Ok(v) = Version::parse(cleaned) {
            return Ok(CoercedVersion::Semver(v));
        }
        // Coerce two-component versions ("4.3") by padding a patch.
        let parts: Vec<&str> = cleaned.split('.').collect();
        if parts.len() == 2 {
            if let Ok(v) = Version::parse(&format!("{}.0", cleaned)) {
                return Ok(CoercedVersion::Semver(v));
            }
        }
        Err(VersionError::Uncoercible(raw.to_string()))
    }

    pub fn raw(&self) -> String {
        match self {
            CoercedVersion::Semver(v) => v.to_string(),
            CoercedVersion::AlwaysLatest(s) => s.clone(),
        }
    }

    pub fn suppress_lower_bound_checks(&self) -> bool {
        matches!(self, CoercedVersion::AlwaysLatest(_))
    }

    pub fn as_semver(&self) -> Option<&Version> {
        match self {
            CoercedVersion::Semver(v) => Some(v),
            CoercedVersion::AlwaysLatest(_) => None,
        }
    }
}

/// A request to provision a binary, immutable after construction (§3 "Binary
/// request").
#[derive(Debug, Clone)]
pub struct BinaryRequest {
    pub version: String,
    pub os: OsDescriptor,
    pub arch: String,
    pub download_dir: PathBuf,
    pub system_binary: Option<PathBuf>,
    pub check_md5: bool,
}

/// Supervisor lifecycle state (§3 "Supervisor state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    New,
    Starting,
    Running,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::New => "new",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopped => "stopped",
        }
    }
}

/// Caller-supplied instance configuration.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    pub port: Option<u16>,
    pub data_path: Option<PathBuf>,
    pub ip: Option<String>,
    pub launch_timeout_ms: Option<u64>,
    pub args: Vec<String>,
    pub auth_options: Option<AuthOptions>,
}

/// Placeholder for the auth hook point named in spec.md §9
/// (`createAuth` exists upstream but is currently unreachable). The
/// interface is specified; the implementation is left for later.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Resolved instance descriptor (§3 "Instance descriptor").
#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    pub port: u16,
    pub data_path: PathBuf,
    pub ip: String,
    pub tmp_dir: bool,
    pub launch_timeout_ms: u64,
    pub args: Vec<String>,
    pub auth_options: Option<AuthOptions>,
}

/// Options to `Supervisor::stop`'s cleanup phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub do_cleanup: bool,
    pub force: bool,
}
