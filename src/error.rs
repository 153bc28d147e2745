use std::path::PathBuf;

use thiserror::Error;

/// Top-level error taxonomy. Every public operation returns one of these
/// variants, directly or via a concern-specific enum that converts into it.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Ensure(#[from] EnsureError),
}

/// Operation invoked in a state that disallows it.
#[derive(Debug, Error)]
#[error("invalid operation in state {actual}: expected one of {allowed:?}")]
pub struct StateError {
    pub allowed: Vec<&'static str>,
    pub actual: &'static str,
}

/// Lockfile acquisition/release failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lockfile at {path} is in an unknown status")]
    UnknownStatus { path: PathBuf },

    #[error("cannot unlock {path}: held by this instance but content no longer matches our uuid")]
    ForeignOwnership { path: PathBuf },

    #[error("cannot unlock {path}: still locked by another live process")]
    StillLocked { path: PathBuf },

    #[error("io error operating on lockfile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Platform/architecture classification failures.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),
}

/// Version coercion and known distro/arch/version incompatibilities.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("cannot coerce '{0}' into a semantic version")]
    Uncoercible(String),

    #[error("{binary} {version} is not supported on {platform}: {reason}")]
    KnownVersionIncompatibility {
        binary: String,
        version: String,
        platform: String,
        reason: String,
    },
}

/// Regex-driven parse failures (archive-name decomposition).
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("archive name '{name}' did not match the expected pattern (missing group {group})")]
    MissingGroup { name: String, group: &'static str },
}

/// Filesystem / binary-location failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("binary not found at any candidate location for '{binary}'")]
    BinaryNotFound { binary: String },

    #[error("insufficient permissions to execute {path}")]
    InsufficientPermissions { path: PathBuf },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Download / network failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("download failed with status {status}: {url}")]
    Status { url: String, status: u16 },

    #[error("{binary} version/platform combination is not available for download (HTTP 403): {url}")]
    NotAvailable { binary: String, url: String },

    #[error("download of {url} ended early: expected {expected} bytes, got {actual}")]
    ShortRead {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("server did not send Content-Length for {url}")]
    MissingContentLength { url: String },

    #[error("MD5 checksum mismatch for {archive}: expected {expected}, got {actual}")]
    Md5Mismatch {
        archive: String,
        expected: String,
        actual: String,
    },

    #[error("too many redirects (limit {limit}) fetching {url}")]
    TooManyRedirects { url: String, limit: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Child-process lifecycle failures.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start binary {binary}: {source}")]
    StartFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("instance closed unexpectedly (code={code:?}, signal={signal:?})")]
    UnexpectedClose {
        code: Option<i32>,
        signal: Option<String>,
    },

    #[error("{0}")]
    InstanceError(String),

    #[error("instance exited before reporting readiness")]
    ExitedBeforeReady,

    #[error("timed out waiting for readiness after {0}ms")]
    LaunchTimeout(u64),
}

/// `ensure_instance` could not produce a running instance.
#[derive(Debug, Error)]
pub enum EnsureError {
    #[error("ensure_instance observed a transition to {0} instead of running")]
    UnexpectedTransition(String),

    #[error("instance info requested before the instance was created")]
    MissingInstanceInfo,
}
