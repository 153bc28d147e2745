//! Dry Locator (C4): a pure path planner. No filesystem writes; only reads
//! (`exists()` checks) to report which candidate, if any, already holds the
//! binary.

use std::path::{Path, PathBuf};

/// Outcome of [`locate`].
#[derive(Debug, Clone)]
pub enum LocateResult {
    /// The binary already exists at this path.
    Found(PathBuf),
    /// Nothing exists yet; this is where a download should land.
    NotFound { preferred_download_path: PathBuf },
}

/// The four candidate paths considered, in priority order, plus the
/// system-binary short-circuit.
pub struct Candidates {
    pub system_binary: Option<PathBuf>,
    pub resolve_config_path: Option<PathBuf>,
    pub legacy_home: PathBuf,
    pub modules_cache: PathBuf,
    pub relative: PathBuf,
}

/// `locate(req) -> path?`. Pure: computes candidates, returns the first that
/// exists, or a preferred path for a future download.
pub fn locate(
    binary_name: &str,
    system_binary: Option<&Path>,
    download_dir: Option<&Path>,
    prefer_global_path: bool,
    home_dir: &Path,
    cwd: &Path,
) -> LocateResult {
    let candidates = build_candidates(
        binary_name,
        system_binary,
        download_dir,
        home_dir,
        cwd,
    );

    if let Some(sb) = &candidates.system_binary {
        if sb.exists() {
            return LocateResult::Found(sb.clone());
        }
    }

    for candidate in [
        candidates.resolve_config_path.as_ref(),
        Some(&candidates.legacy_home),
        Some(&candidates.modules_cache),
        Some(&candidates.relative),
    ]
    .into_iter()
    .flatten()
    {
        if candidate.exists() {
            return LocateResult::Found(candidate.clone());
        }
    }

    let preferred = candidates
        .resolve_config_path
        .clone()
        .or_else(|| prefer_global_path.then(|| candidates.legacy_home.clone()))
        .unwrap_or(candidates.modules_cache.clone());

    LocateResult::NotFound {
        preferred_download_path: preferred,
    }
}

fn build_candidates(
    binary_name: &str,
    system_binary: Option<&Path>,
    download_dir: Option<&Path>,
    home_dir: &Path,
    cwd: &Path,
) -> Candidates {
    Candidates {
        system_binary: system_binary.map(Path::to_path_buf),
        resolve_config_path: download_dir.map(|d| d.join(binary_name)),
        legacy_home: home_dir.join(".cache").join("minio-binaries").join(binary_name),
        modules_cache: modules_cache_path(cwd).join(binary_name),
        relative: cwd.join("minio-binaries").join(binary_name),
    }
}

/// Project-cache-dir: walks upward past any `target/miniots-cache*` segments
/// to the containing project root, then appends a stable cache directory
/// name. This is the Rust analogue of walking past a nested
/// `node_modules/minio-test-server*` install.
fn modules_cache_path(cwd: &Path) -> PathBuf {
    let mut root = cwd;
    for ancestor in cwd.ancestors() {
        if let Some(name) = ancestor.file_name().and_then(|n| n.to_str()) {
            if name == "target" || name.starts_with("miniots-cache") {
                if let Some(parent) = ancestor.parent() {
                    root = parent;
                    continue;
                }
            }
        }
        break;
    }
    root.join("target").join("miniots-cache")
}
