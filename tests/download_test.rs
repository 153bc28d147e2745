use std::io::Write;
use std::sync::Arc;

use miniots::download::{BinaryCache, DownloadOptions, Downloader};
use miniots::lockfile::LockRegistry;
use miniots::platform::OsDescriptor;
use miniots::types::BinaryRequest;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn linux_os() -> OsDescriptor {
    OsDescriptor {
        os: "linux".to_string(),
        distro: Some("ubuntu".to_string()),
        release: Some("22.04".to_string()),
        codename: Some("jammy".to_string()),
        id_like: vec!["debian".to_string()],
    }
}

fn build_targz_with_binary(contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "minio-release/bin/minio", contents)
        .unwrap();
    let tar_bytes = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[tokio::test]
async fn fresh_provision_downloads_verifies_and_extracts() {
    let server = MockServer::start().await;
    let archive = build_targz_with_binary(b"fake minio binary contents");
    let checksum = md5_hex(&archive);

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/[0-9.]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/.*\.md5$"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{checksum}  archive.tar.gz")))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let req = BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: tmp.path().to_path_buf(),
        system_binary: None,
        check_md5: true,
    };

    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let opts = DownloadOptions {
        mirror: Some(server.uri()),
        check_md5: true,
        ..Default::default()
    };

    let path = downloader.provision(&req, "minio-amd64-ubuntu22.04-2024.10.02.00.00.00", &opts).await.unwrap();
    assert!(path.exists());
    assert_eq!(std::fs::read(&path).unwrap(), b"fake minio binary contents");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o775);
    }
}

#[tokio::test]
async fn md5_mismatch_aborts_and_leaves_no_binary() {
    let server = MockServer::start().await;
    let archive = build_targz_with_binary(b"some contents");

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/[0-9.]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/.*\.md5$"))
        .respond_with(ResponseTemplate::new(200).set_body_string("deadbeefdeadbeefdeadbeefdeadbeef  archive.tar.gz"))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let binary_name = "minio-amd64-ubuntu22.04-2024.10.02.00.00.00";
    let req = BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: tmp.path().to_path_buf(),
        system_binary: None,
        check_md5: true,
    };

    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let opts = DownloadOptions {
        mirror: Some(server.uri()),
        check_md5: true,
        ..Default::default()
    };

    let result = downloader.provision(&req, binary_name, &opts).await;
    assert!(result.is_err());
    assert!(!tmp.path().join(binary_name).exists());
}

#[tokio::test]
async fn http_403_reports_platform_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/[0-9.]+$"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let req = BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: tmp.path().to_path_buf(),
        system_binary: None,
        check_md5: false,
    };

    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let opts = DownloadOptions {
        mirror: Some(server.uri()),
        check_md5: false,
        ..Default::default()
    };

    let err = downloader
        .provision(&req, "minio-amd64-ubuntu22.04-2024.10.02.00.00.00", &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, miniots::error::NetworkError::NotAvailable { .. }));
}

#[tokio::test]
async fn http_500_reports_status_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/[0-9.]+$"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let req = BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: tmp.path().to_path_buf(),
        system_binary: None,
        check_md5: false,
    };

    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let opts = DownloadOptions {
        mirror: Some(server.uri()),
        check_md5: false,
        ..Default::default()
    };

    let err = downloader
        .provision(&req, "minio-amd64-ubuntu22.04-2024.10.02.00.00.00", &opts)
        .await
        .unwrap_err();
    match err {
        miniots::error::NetworkError::Status { status, .. } => assert_eq!(status, 500),
        other => panic!("expected Status error, got {other:?}"),
    }
}

#[tokio::test]
async fn max_redirects_boundary_n_succeeds_n_plus_one_fails() {
    let server = MockServer::start().await;
    let archive = build_targz_with_binary(b"redirected contents");

    // Three hops of 302s before the final 200, per spec.md §8's "mock chain
    // of N+1 hops failing, N succeeding."
    Mock::given(method("GET"))
        .and(path_regex(r"^/hop0$"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/hop1", server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/hop1$"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/hop2", server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/hop2$"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/final", server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/final$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
        .mount(&server)
        .await;

    let make_req = |dir: &std::path::Path| BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: dir.to_path_buf(),
        system_binary: None,
        check_md5: false,
    };

    // Three hops: max_redirects=3 must follow all of them to the final 200.
    let tmp_ok = tempfile::tempdir().unwrap();
    let opts_ok = DownloadOptions {
        download_url: Some(format!("{}/hop0", server.uri())),
        check_md5: false,
        max_redirects: 3,
        ..Default::default()
    };
    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let result = downloader
        .provision(&make_req(tmp_ok.path()), "minio-amd64-ubuntu22.04-2024.10.02.00.00.00", &opts_ok)
        .await;
    assert!(result.is_ok(), "3 redirects with max_redirects=3 should succeed: {result:?}");

    // Same chain with max_redirects=2 must fail before reaching /final.
    let tmp_fail = tempfile::tempdir().unwrap();
    let opts_fail = DownloadOptions {
        download_url: Some(format!("{}/hop0", server.uri())),
        check_md5: false,
        max_redirects: 2,
        ..Default::default()
    };
    let downloader = Downloader::new(LockRegistry::new(), BinaryCache::new());
    let result = downloader
        .provision(&make_req(tmp_fail.path()), "minio-amd64-ubuntu22.04-2024.10.02.00.00.00", &opts_fail)
        .await;
    assert!(result.is_err(), "3 redirects with max_redirects=2 should fail");
}

#[tokio::test]
async fn concurrent_provisioning_hits_network_exactly_once() {
    let server = MockServer::start().await;
    let archive = build_targz_with_binary(b"concurrent fetch contents");
    let checksum = md5_hex(&archive);

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/[0-9.]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/linux-amd64/archive/.*\.md5$"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{checksum}  a")))
        .mount(&server)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let locks = LockRegistry::new();
    let cache = BinaryCache::new();
    let binary_name = "minio-amd64-ubuntu22.04-2024.10.02.00.00.00";

    let make_req = || BinaryRequest {
        version: "2024.10.02.00.00.00".to_string(),
        os: linux_os(),
        arch: "amd64".to_string(),
        download_dir: tmp.path().to_path_buf(),
        system_binary: None,
        check_md5: true,
    };
    let opts = Arc::new(DownloadOptions {
        mirror: Some(server.uri()),
        check_md5: true,
        ..Default::default()
    });

    let mut handles = Vec::new();
    for _ in 0..4 {
        let locks = locks.clone();
        let cache = cache.clone();
        let opts = opts.clone();
        let req = make_req();
        handles.push(tokio::spawn(async move {
            let downloader = Downloader::new(locks, cache);
            downloader.provision(&req, binary_name, &opts).await
        }));
    }

    let mut paths = Vec::new();
    for h in handles {
        paths.push(h.await.unwrap().unwrap());
    }
    assert!(paths.windows(2).all(|w| w[0] == w[1]));

    let lock_path = tmp.path().join("2024.10.02.00.00.00.lock");
    assert!(!lock_path.exists());
}
