//! An ephemeral, programmatically-controlled object-storage server for
//! integration tests.
//!
//! Given a requested version of an upstream S3-compatible server binary,
//! this crate resolves the correct platform-specific artifact, fetches and
//! verifies it (with cross-process coordination so that concurrent test
//! runs share a cache without racing), then supervises its lifetime as a
//! child process, surfacing a fully-initialized instance to callers and
//! guaranteeing orderly cleanup.
//!
//! This crate implements the binary-provisioning and instance-supervision
//! subsystem only; it does not implement the S3 protocol itself — the
//! supervised server binary does.

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod lockfile;
pub mod locate;
pub mod output;
pub mod platform;
pub mod reaper;
pub mod resolve;
pub mod supervisor;
pub mod types;

pub use config::{Config, ConfigKey};
pub use error::Error;
pub use events::Event;
pub use lockfile::{LockHandle, LockRegistry};
pub use platform::OsDescriptor;
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
pub use types::{
    AuthOptions, BinaryRequest, CleanupOptions, InstanceDescriptor, InstanceOptions, SupervisorState,
};

/// Initialize structured logging if `DEBUG` is configured, mirroring the
/// crate's own `tracing` setup. Best-effort: a prior subscriber is left in
/// place, it is not an error to call this twice.
pub fn init_tracing_if_debug(config: &Config) {
    if !config.resolve_bool(ConfigKey::Debug) {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Convenience entry point: build a [`Supervisor`] wired to a fresh lock
/// registry and binary cache, resolving its static configuration from C1
/// (env → manifest → defaults), C2 (host probe, overridable via
/// `PLATFORM`/`ARCH`/`DISTRO`), and C3 (canonical binary naming).
pub fn supervisor_from_config(config: &Config) -> std::sync::Arc<Supervisor> {
    let mut os = platform::probe();
    if let Some(platform_override) = config.resolve(ConfigKey::Platform) {
        os.os = platform_override;
    }
    if let Some(distro_override) = config.resolve(ConfigKey::Distro) {
        os.distro = Some(distro_override);
    }
    let arch = config
        .resolve(ConfigKey::Arch)
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());
    let home_dir = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));

    let download_dir = config
        .resolve(ConfigKey::DownloadDir)
        .map(std::path::PathBuf::from);
    let system_binary = config
        .resolve(ConfigKey::SystemBinary)
        .map(std::path::PathBuf::from);
    let version = config
        .resolve(ConfigKey::Version)
        .unwrap_or_else(|| config::PINNED_VERSION.to_string());
    let check_md5 = config.resolve_bool(ConfigKey::Md5Check);

    // C3: derive the canonical on-disk binary name from (version, os, arch,
    // distro) rather than accepting it as an opaque caller-supplied string.
    let use_archive_name = config.resolve_bool(ConfigKey::UseArchiveNameForBinaryName);
    let archive_name_override = config.resolve(ConfigKey::ArchiveName);
    let naming_req = types::BinaryRequest {
        version: version.clone(),
        os: os.clone(),
        arch: arch.clone(),
        download_dir: download_dir
            .clone()
            .unwrap_or_else(|| home_dir.join(".cache").join("minio-binaries")),
        system_binary: system_binary.clone(),
        check_md5,
    };
    let binary_name = resolve::binary_name(&naming_req, use_archive_name, archive_name_override.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "binary name resolution failed; using legacy fallback name");
            format!("minio-{arch}-{os}-{version}", os = naming_req.os.os)
        });

    let download_opts = download::DownloadOptions {
        download_url: config.resolve(ConfigKey::DownloadUrl),
        mirror: config.resolve(ConfigKey::DownloadMirror),
        max_redirects: config
            .resolve(ConfigKey::MaxRedirects)
            .and_then(|v| v.parse().ok())
            .unwrap_or(2),
        use_http: config.resolve_bool(ConfigKey::UseHttp),
        strict_ssl: download::strict_ssl_from_env(),
        check_md5,
    };

    let supervisor_config = supervisor::SupervisorConfig {
        binary_name,
        download_dir,
        system_binary,
        prefer_global_path: config.resolve_bool(ConfigKey::PreferGlobalPath),
        home_dir,
        version,
        os,
        arch,
        check_md5,
        download_opts,
        runtime_download: config.resolve_bool(ConfigKey::RuntimeDownload),
    };

    Supervisor::new(supervisor_config, LockRegistry::new(), download::BinaryCache::new())
}
