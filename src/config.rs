//! Config Resolver (C1): env → manifest → built-in defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Recognized configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    DownloadDir,
    Platform,
    Arch,
    Version,
    Debug,
    DownloadMirror,
    DownloadUrl,
    PreferGlobalPath,
    DisablePostinstall,
    SystemBinary,
    Md5Check,
    ArchiveName,
    RuntimeDownload,
    UseHttp,
    SystemBinaryVersionCheck,
    UseArchiveNameForBinaryName,
    MaxRedirects,
    Distro,
}

impl ConfigKey {
    /// The `MINIOTST_`-prefixed environment variable name.
    fn env_name(self) -> &'static str {
        match self {
            ConfigKey::DownloadDir => "MINIOTST_DOWNLOAD_DIR",
            ConfigKey::Platform => "MINIOTST_PLATFORM",
            ConfigKey::Arch => "MINIOTST_ARCH",
            ConfigKey::Version => "MINIOTST_VERSION",
            ConfigKey::Debug => "MINIOTST_DEBUG",
            ConfigKey::DownloadMirror => "MINIOTST_DOWNLOAD_MIRROR",
            ConfigKey::DownloadUrl => "MINIOTST_DOWNLOAD_URL",
            ConfigKey::PreferGlobalPath => "MINIOTST_PREFER_GLOBAL_PATH",
            ConfigKey::DisablePostinstall => "MINIOTST_DISABLE_POSTINSTALL",
            ConfigKey::SystemBinary => "MINIOTST_SYSTEM_BINARY",
            ConfigKey::Md5Check => "MINIOTST_MD5_CHECK",
            ConfigKey::ArchiveName => "MINIOTST_ARCHIVE_NAME",
            ConfigKey::RuntimeDownload => "MINIOTST_RUNTIME_DOWNLOAD",
            ConfigKey::UseHttp => "MINIOTST_USE_HTTP",
            ConfigKey::SystemBinaryVersionCheck => "MINIOTST_SYSTEM_BINARY_VERSION_CHECK",
            ConfigKey::UseArchiveNameForBinaryName => {
                "MINIOTST_USE_ARCHIVE_NAME_FOR_BINARY_NAME"
            }
            ConfigKey::MaxRedirects => "MINIOTST_MAX_REDIRECTS",
            ConfigKey::Distro => "MINIOTST_DISTRO",
        }
    }

    /// The camelCase key used inside the manifest's nested config table.
    fn manifest_key(self) -> &'static str {
        match self {
            ConfigKey::DownloadDir => "downloadDir",
            ConfigKey::Platform => "platform",
            ConfigKey::Arch => "arch",
            ConfigKey::Version => "version",
            ConfigKey::Debug => "debug",
            ConfigKey::DownloadMirror => "downloadMirror",
            ConfigKey::DownloadUrl => "downloadUrl",
            ConfigKey::PreferGlobalPath => "preferGlobalPath",
            ConfigKey::DisablePostinstall => "disablePostinstall",
            ConfigKey::SystemBinary => "systemBinary",
            ConfigKey::Md5Check => "md5Check",
            ConfigKey::ArchiveName => "archiveName",
            ConfigKey::RuntimeDownload => "runtimeDownload",
            ConfigKey::UseHttp => "useHttp",
            ConfigKey::SystemBinaryVersionCheck => "systemBinaryVersionCheck",
            ConfigKey::UseArchiveNameForBinaryName => "useArchiveNameForBinaryName",
            ConfigKey::MaxRedirects => "maxRedirects",
            ConfigKey::Distro => "distro",
        }
    }

    /// Paths in manifest values that must be resolved relative to the
    /// manifest's directory.
    fn is_path_valued(self) -> bool {
        matches!(self, ConfigKey::DownloadDir | ConfigKey::SystemBinary)
    }

    fn builtin_default(self) -> Option<&'static str> {
        match self {
            ConfigKey::Version => Some(PINNED_VERSION),
            ConfigKey::PreferGlobalPath => Some("true"),
            ConfigKey::RuntimeDownload => Some("true"),
            ConfigKey::UseHttp => Some("false"),
            ConfigKey::SystemBinaryVersionCheck => Some("true"),
            ConfigKey::UseArchiveNameForBinaryName => Some("false"),
            ConfigKey::MaxRedirects => Some("2"),
            _ => None,
        }
    }
}

/// Built-in pinned release version used when `VERSION` is not overridden.
pub const PINNED_VERSION: &str = "2024.10.02.00.00.00";

/// Deserialization target for the `[package.metadata.miniots]` table.
#[derive(Debug, Default, Deserialize)]
struct ManifestRoot {
    #[serde(default)]
    package: Option<ManifestPackage>,
    #[serde(default)]
    workspace: Option<ManifestWorkspace>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestPackage {
    #[serde(default)]
    metadata: Option<ManifestMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestWorkspace {
    #[serde(default)]
    metadata: Option<ManifestMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    miniots: Option<HashMap<String, toml::Value>>,
}

/// A resolved manifest: its directory (for relative path resolution) and its
/// non-empty `miniots` config table.
struct ResolvedManifest {
    dir: PathBuf,
    table: HashMap<String, toml::Value>,
}

/// Resolves configuration options by walking env → manifest → defaults.
#[derive(Debug, Clone)]
pub struct Config {
    manifest: Option<(PathBuf, HashMap<String, String>)>,
}

impl Config {
    /// Discover the manifest by walking upward from `start_dir`, and build a
    /// resolver rooted there.
    pub fn discover(start_dir: &Path) -> Self {
        let manifest = find_manifest(start_dir).map(|m| {
            let stringified = m
                .table
                .into_iter()
                .map(|(k, v)| (k, toml_value_to_string(&v)))
                .collect();
            (m.dir, stringified)
        });
        Config { manifest }
    }

    /// Discover starting from the current working directory.
    pub fn discover_from_cwd() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::discover(&cwd)
    }

    /// Resolve a key: env → manifest → built-in default.
    pub fn resolve(&self, key: ConfigKey) -> Option<String> {
        if let Ok(v) = std::env::var(key.env_name()) {
            if !v.is_empty() {
                return Some(v);
            }
        }

        if let Some((dir, table)) = &self.manifest {
            if let Some(raw) = table.get(key.manifest_key()) {
                if key.is_path_valued() {
                    let p = Path::new(raw);
                    return Some(if p.is_absolute() {
                        p.to_string_lossy().into_owned()
                    } else {
                        dir.join(p).to_string_lossy().into_owned()
                    });
                }
                return Some(raw.clone());
            }
        }

        key.builtin_default().map(str::to_string)
    }

    /// Resolve a key and parse it as a boolean (`{1,on,yes,true}`
    /// case-insensitive; anything else is false). Missing values are false.
    pub fn resolve_bool(&self, key: ConfigKey) -> bool {
        self.resolve(key)
            .map(|v| parse_bool(&v))
            .unwrap_or(false)
    }
}

/// Boolean parsing per spec.md §4.1.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "on" | "yes" | "true"
    )
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk upward from `start_dir`, reading each `Cargo.toml` in turn, and stop
/// at the first one whose `[package.metadata.miniots]` or
/// `[workspace.metadata.miniots]` table is non-empty.
fn find_manifest(start_dir: &Path) -> Option<ResolvedManifest> {
    for dir in start_dir.ancestors() {
        let manifest_path = dir.join("Cargo.toml");
        let Ok(content) = std::fs::read_to_string(&manifest_path) else {
            continue;
        };
        let Ok(parsed) = toml::from_str::<ManifestRoot>(&content) else {
            continue;
        };

        let table = parsed
            .package
            .and_then(|p| p.metadata)
            .and_then(|m| m.miniots)
            .or_else(|| {
                parsed
                    .workspace
                    .and_then(|w| w.metadata)
                    .and_then(|m| m.miniots)
            });

        if let Some(table) = table {
            if !table.is_empty() {
                return Some(ResolvedManifest {
                    dir: dir.to_path_buf(),
                    table,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_bool() {
        for v in ["1", "on", "yes", "true", "TRUE", "On", "YES"] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["0", "off", "no", "false", "", "garbage"] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn test_builtin_defaults() {
        let cfg = Config { manifest: None };
        assert_eq!(cfg.resolve(ConfigKey::Version).as_deref(), Some(PINNED_VERSION));
        assert!(cfg.resolve_bool(ConfigKey::PreferGlobalPath));
        assert!(cfg.resolve_bool(ConfigKey::RuntimeDownload));
        assert!(!cfg.resolve_bool(ConfigKey::UseHttp));
        assert_eq!(cfg.resolve(ConfigKey::MaxRedirects).as_deref(), Some("2"));
        assert_eq!(cfg.resolve(ConfigKey::DownloadDir), None);
    }

    #[test]
    fn test_env_overrides_default() {
        std::env::set_var("MINIOTST_MAX_REDIRECTS", "9");
        let cfg = Config { manifest: None };
        assert_eq!(cfg.resolve(ConfigKey::MaxRedirects).as_deref(), Some("9"));
        std::env::remove_var("MINIOTST_MAX_REDIRECTS");
    }

    #[test]
    fn test_manifest_discovery_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let manifest_path = root.path().join("Cargo.toml");
        let mut f = std::fs::File::create(&manifest_path).unwrap();
        writeln!(
            f,
            r#"
[package]
name = "whatever"
version = "0.1.0"

[package.metadata.miniots]
downloadDir = "my-cache"
version = "2024.01.01.00.00.00"
"#
        )
        .unwrap();

        let cfg = Config::discover(&nested);
        assert_eq!(
            cfg.resolve(ConfigKey::Version).as_deref(),
            Some("2024.01.01.00.00.00")
        );
        let dd = cfg.resolve(ConfigKey::DownloadDir).unwrap();
        assert!(Path::new(&dd).is_absolute());
        assert!(dd.ends_with("my-cache"));
    }

    #[test]
    fn test_empty_metadata_table_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let manifest_path = root.path().join("Cargo.toml");
        std::fs::write(
            &manifest_path,
            r#"
[package]
name = "whatever"
version = "0.1.0"

[package.metadata.miniots]
"#,
        )
        .unwrap();

        let cfg = Config::discover(root.path());
        assert_eq!(cfg.resolve(ConfigKey::DownloadDir), None);
    }
}
