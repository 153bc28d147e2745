//! Downloader (C6): acquires the lock, HTTP-downloads with redirect limit
//! and optional proxy, verifies MD5, extracts, installs atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::NetworkError;
use crate::lockfile::LockRegistry;
use crate::resolve;
use crate::types::BinaryRequest;

static ARCHIVE_BINARY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bin/(minio|minio\.exe)$").unwrap());

/// Environment variables consulted for proxy selection, in precedence order
/// (the JS-ecosystem npm/yarn proxy convention, preserved verbatim per §4.6).
const PROXY_ENV_PRECEDENCE: &[&str] = &[
    "yarn_https-proxy",
    "yarn_proxy",
    "npm_config_https-proxy",
    "npm_config_proxy",
    "https_proxy",
    "http_proxy",
    "HTTPS_PROXY",
    "HTTP_PROXY",
];

/// Caller-supplied knobs that would otherwise come from the Config
/// Resolver; kept explicit here so this module has no global-state
/// dependency on C1.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub download_url: Option<String>,
    pub mirror: Option<String>,
    pub max_redirects: u32,
    pub use_http: bool,
    pub strict_ssl: bool,
    pub check_md5: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            download_url: None,
            mirror: None,
            max_redirects: 2,
            use_http: false,
            strict_ssl: strict_ssl_from_env(),
            check_md5: true,
        }
    }
}

/// TLS verification is governed by `npm_config_strict_ssl`, preserved
/// verbatim from the upstream ecosystem convention per §4.6 step 4.
/// Defaults to `true` (verify) when unset.
pub fn strict_ssl_from_env() -> bool {
    std::env::var("npm_config_strict_ssl")
        .map(|v| crate::config::parse_bool(&v))
        .unwrap_or(true)
}

/// Progress reporting throttled to at most one update per 2 seconds, with a
/// forced final update, per §4.6's closing paragraph.
struct ThrottledProgress {
    bar: ProgressBar,
    last_report: Instant,
    interval: Duration,
}

impl ThrottledProgress {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "  [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap()
            .progress_chars("=> "),
        );
        ThrottledProgress {
            bar,
            last_report: Instant::now() - Duration::from_secs(3),
            interval: Duration::from_secs(2),
        }
    }

    fn report(&mut self, position: u64, force: bool) {
        if force || self.last_report.elapsed() >= self.interval {
            self.bar.set_position(position);
            self.last_report = Instant::now();
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Process-local `version → path` cache, populated only after a successful
/// provision (§3 "Binary cache entry").
#[derive(Default)]
pub struct BinaryCache {
    entries: AsyncMutex<HashMap<String, PathBuf>>,
}

impl BinaryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(BinaryCache::default())
    }

    async fn get(&self, version: &str) -> Option<PathBuf> {
        self.entries.lock().await.get(version).cloned()
    }

    async fn insert(&self, version: String, path: PathBuf) {
        self.entries.lock().await.insert(version, path);
    }
}

/// The Downloader. Holds the shared lock registry and binary cache so
/// concurrent callers in-process share both, per §3's "Ownership" note.
pub struct Downloader {
    client: reqwest::Client,
    locks: Arc<LockRegistry>,
    cache: Arc<BinaryCache>,
}

impl Downloader {
    pub fn new(locks: Arc<LockRegistry>, cache: Arc<BinaryCache>) -> Self {
        Downloader {
            client: reqwest::Client::new(),
            locks,
            cache,
        }
    }

    /// `provision(req) -> absolute binary path`.
    pub async fn provision(
        &self,
        req: &BinaryRequest,
        binary_name: &str,
        opts: &DownloadOptions,
    ) -> Result<PathBuf, NetworkError> {
        ensure_download_dir(&req.download_dir)?;

        let target_path = req.download_dir.join(binary_name);
        let lock_path = req.download_dir.join(format!("{}.lock", req.version));

        let mut handle = self
            .locks
            .lock(&lock_path)
            .await
            .map_err(|e| NetworkError::Extraction(e.to_string()))?;

        let result = self
            .provision_locked(req, binary_name, &target_path, opts)
            .await;

        handle
            .unlock()
            .map_err(|e| NetworkError::Extraction(e.to_string()))?;

        result
    }

    async fn provision_locked(
        &self,
        req: &BinaryRequest,
        binary_name: &str,
        target_path: &Path,
        opts: &DownloadOptions,
    ) -> Result<PathBuf, NetworkError> {
        if let Some(cached) = self.cache.get(&req.version).await {
            if cached.exists() {
                return Ok(cached);
            }
        }

        let client = build_client(opts)?;
        let url = resolve::archive_url(req, opts.download_url.as_deref(), opts.mirror.as_deref())
            .map_err(|e| NetworkError::Extraction(e.to_string()))?;
        let url = apply_scheme_override(&url, opts.use_http);

        let archive_path = download_archive(&client, &url).await?;

        if opts.check_md5 && req.check_md5 {
            verify_md5(&client, &url, &archive_path).await?;
        }

        extract_binary(&archive_path, target_path)?;
        let _ = std::fs::remove_file(&archive_path);

        self.cache
            .insert(req.version.clone(), target_path.to_path_buf())
            .await;

        tracing::debug!(binary = binary_name, path = %target_path.display(), "provisioned binary");
        Ok(target_path.to_path_buf())
    }
}

fn ensure_download_dir(dir: &Path) -> Result<(), NetworkError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(dir)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

fn build_client(opts: &DownloadOptions) -> Result<reqwest::Client, NetworkError> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(!opts.strict_ssl)
        .redirect(reqwest::redirect::Policy::limited(opts.max_redirects as usize));

    if let Some(proxy_url) = resolve_proxy() {
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }

    Ok(builder.build()?)
}

fn resolve_proxy() -> Option<String> {
    PROXY_ENV_PRECEDENCE
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

fn apply_scheme_override(url: &str, use_http: bool) -> String {
    if use_http && url.starts_with("https://") {
        format!("http://{}", &url["https://".len()..])
    } else {
        url.to_string()
    }
}

async fn download_archive(client: &reqwest::Client, url: &str) -> Result<PathBuf, NetworkError> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::FORBIDDEN {
        return Err(NetworkError::NotAvailable {
            binary: "minio".to_string(),
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(NetworkError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let expected_len = response.content_length();
    let is_md5 = url.ends_with(".md5");

    let tmp = tempfile::Builder::new()
        .prefix("miniots-archive-")
        .suffix(".downloading")
        .tempfile()
        .map_err(NetworkError::Io)?;
    let final_path = tmp.path().with_extension("");
    let (file, tmp_path) = tmp.keep().map_err(|e| NetworkError::Io(e.error))?;
    let mut file = std::fs::File::from(file);

    let mut progress = expected_len.map(ThrottledProgress::new);
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    use std::io::Write;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        received += chunk.len() as u64;
        if let Some(p) = progress.as_mut() {
            p.report(received, false);
        }
    }
    if let Some(p) = progress.as_mut() {
        p.report(received, true);
        p.finish();
    }
    drop(file);

    if !is_md5 {
        let Some(expected) = expected_len else {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(NetworkError::MissingContentLength { url: url.to_string() });
        };
        if received < expected {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(NetworkError::ShortRead {
                url: url.to_string(),
                expected,
                actual: received,
            });
        }
    }

    std::fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

async fn verify_md5(
    client: &reqwest::Client,
    archive_url: &str,
    archive_path: &Path,
) -> Result<(), NetworkError> {
    let md5_url = format!("{archive_url}.md5");
    let response = client.get(&md5_url).send().await?;
    if !response.status().is_success() {
        return Err(NetworkError::Status {
            url: md5_url,
            status: response.status().as_u16(),
        });
    }
    let text = response.text().await?;
    let expected = text
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();

    let data = std::fs::read(archive_path)?;
    let mut hasher = Md5::new();
    hasher.update(&data);
    let actual = format!("{:x}", hasher.finalize());

    if actual != expected {
        return Err(NetworkError::Md5Mismatch {
            archive: archive_path.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Extract: `.tar.gz`/`.tgz` via streaming tar over gzip; `.zip` via zip
/// reader. Copy only entries matching `bin/(minio|minio\.exe)$`, mode
/// `0o775`.
fn extract_binary(archive_path: &Path, target_path: &Path) -> Result<(), NetworkError> {
    let bytes = std::fs::read(archive_path)?;
    let is_zip = bytes.starts_with(b"PK\x03\x04");

    let data = if is_zip {
        extract_from_zip(&bytes)?
    } else {
        extract_from_targz(&bytes)?
    };

    atomic_write_binary(&data, target_path)
}

fn extract_from_targz(bytes: &[u8]) -> Result<Vec<u8>, NetworkError> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tar::Archive;

    let decoder = GzDecoder::new(bytes);
    let mut archive = Archive::new(decoder);

    for entry in archive
        .entries()
        .map_err(|e| NetworkError::Extraction(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| NetworkError::Extraction(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| NetworkError::Extraction(e.to_string()))?;
        let path_str = path.to_string_lossy();

        if ARCHIVE_BINARY_PATTERN.is_match(&path_str) {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| NetworkError::Extraction(e.to_string()))?;
            return Ok(buf);
        }
    }

    Err(NetworkError::Extraction(
        "no entry matching bin/(minio|minio.exe) found in archive".to_string(),
    ))
}

fn extract_from_zip(bytes: &[u8]) -> Result<Vec<u8>, NetworkError> {
    use std::io::{Cursor, Read};

    let reader = Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| NetworkError::Extraction(e.to_string()))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| NetworkError::Extraction(e.to_string()))?;
        let name = file.name().to_string();

        if ARCHIVE_BINARY_PATTERN.is_match(&name) {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)
                .map_err(|e| NetworkError::Extraction(e.to_string()))?;
            return Ok(buf);
        }
    }

    Err(NetworkError::Extraction(
        "no entry matching bin/(minio|minio.exe) found in archive".to_string(),
    ))
}

fn atomic_write_binary(data: &[u8], target_path: &Path) -> Result<(), NetworkError> {
    use std::io::Write;

    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = target_path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.flush()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o775))?;
    }

    std::fs::rename(&temp_path, target_path).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        NetworkError::Io(e)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_binary_pattern_matches_nested_entry() {
        assert!(ARCHIVE_BINARY_PATTERN.is_match("minio-release/bin/minio"));
        assert!(ARCHIVE_BINARY_PATTERN.is_match("bin/minio.exe"));
        assert!(!ARCHIVE_BINARY_PATTERN.is_match("bin/minio.sig"));
        assert!(!ARCHIVE_BINARY_PATTERN.is_match("LICENSE"));
    }

    #[test]
    fn test_apply_scheme_override() {
        assert_eq!(
            apply_scheme_override("https://dl.min.io/x", true),
            "http://dl.min.io/x"
        );
        assert_eq!(
            apply_scheme_override("https://dl.min.io/x", false),
            "https://dl.min.io/x"
        );
    }

    #[test]
    fn test_resolve_proxy_precedence() {
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("https_proxy");
        std::env::set_var("HTTP_PROXY", "http://low-priority.example");
        std::env::set_var("https_proxy", "http://high-priority.example");
        assert_eq!(
            resolve_proxy().as_deref(),
            Some("http://high-priority.example")
        );
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("https_proxy");
    }

    #[test]
    fn test_atomic_write_sets_mode_0775() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("minio");
        atomic_write_binary(b"fake binary", &target).unwrap();
        assert!(target.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o775);
        }
    }
}
