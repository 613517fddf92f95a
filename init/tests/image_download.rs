//! Integration tests for streaming an image over HTTP into a scratch file.
//!
//! A one-shot HTTP server on localhost stands in for the image server; the
//! body goes through `HttpFetcher` and a `DecodingWriter` straight into a
//! file, as the boot pipeline does.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use baas_init::fetch::{AssetFetch, HttpFetcher};
use baas_init::storage::{Compression, DecodingWriter};
use baas_shared::errors::BaasError;
use flate2::write::GzEncoder;
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Serve `body` once at any path and return the base URL.
fn serve_once(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("read request");
            if line.trim_end().is_empty() {
                break;
            }
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).expect("write head");
        stream.write_all(&body).expect("write body");
    });

    format!("http://{}", addr)
}

fn disk_image() -> Vec<u8> {
    (0..256 * 1024).map(|i| (i % 251) as u8).collect()
}

fn download(url: &str, compression: Compression, dir: &TempDir) -> Result<Vec<u8>, BaasError> {
    let target = dir.path().join("abc-1.img");
    let fetcher = HttpFetcher::new("http://localhost:9090", Duration::from_secs(10));

    let file = File::create(&target).expect("create scratch file");
    let mut writer = DecodingWriter::new(compression, file).expect("decoder");
    fetcher.fetch(url, &mut writer)?;
    writer.finish().expect("finish");

    Ok(std::fs::read(&target).expect("read scratch file"))
}

// ============================================================================
// STREAMING
// ============================================================================

#[test]
fn raw_image_lands_unchanged() {
    let dir = TempDir::new().unwrap();
    let base = serve_once(disk_image());

    let written = download(&format!("{}/image/abc/1", base), Compression::None, &dir).unwrap();
    assert_eq!(written, disk_image());
}

#[test]
fn gzip_image_is_decompressed_while_streaming() {
    let dir = TempDir::new().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&disk_image()).unwrap();
    let base = serve_once(encoder.finish().unwrap());

    let compression = Compression::from_strategy("GZip").unwrap();
    let written = download(&format!("{}/image/abc/1", base), compression, &dir).unwrap();
    assert_eq!(written, disk_image());
}

#[test]
fn zstd_image_is_decompressed_while_streaming() {
    let dir = TempDir::new().unwrap();
    let base = serve_once(zstd::stream::encode_all(&disk_image()[..], 3).unwrap());

    let compression = Compression::from_strategy("zstd").unwrap();
    let written = download(&format!("{}/image/abc/1", base), compression, &dir).unwrap();
    assert_eq!(written, disk_image());
}

#[test]
fn unreachable_server_is_transport_failure() {
    let dir = TempDir::new().unwrap();
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let err = download(
        &format!("http://127.0.0.1:{}/image/abc/1", port),
        Compression::None,
        &dir,
    )
    .unwrap_err();
    assert!(matches!(err, BaasError::Transport(_)));
}
