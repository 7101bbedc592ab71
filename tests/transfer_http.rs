//! Transfer tests against a canned HTTP server on a loopback listener.
//! The server answers one request per connection and closes it, so each
//! client request is observed individually.

use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use asr_assets::{
    Acquirer, AcquirerConfig, AcquisitionEvent, AcquisitionState, CancellationToken, Catalog,
    ModelDescriptor, ModelFamily, TransferManager,
};
use bzip2::write::BzEncoder;
use bzip2::Compression;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct HttpRequest {
    method: String,
    range_start: Option<u64>,
}

fn read_request(stream: &mut TcpStream) -> HttpRequest {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    let text = String::from_utf8_lossy(&head);
    let method = text
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    let mut range_start = None;
    for line in text.lines().skip(1) {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("range:") {
            range_start = value
                .trim()
                .strip_prefix("bytes=")
                .and_then(|spec| spec.split('-').next())
                .and_then(|start| start.parse().ok());
        }
    }
    HttpRequest { method, range_start }
}

fn spawn_server<F>(handler: F) -> String
where
    F: Fn(&HttpRequest) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let request = read_request(&mut stream);
            let _ = stream.write_all(&handler(&request));
            let _ = stream.shutdown(Shutdown::Both);
        }
    });
    format!("http://{addr}")
}

fn full_response(method: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    if method != "HEAD" {
        response.extend_from_slice(body);
    }
    response
}

fn partial_response(full: &[u8], start: u64) -> Vec<u8> {
    let start = start as usize;
    let suffix = &full[start..];
    let mut response = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
        suffix.len(),
        start,
        full.len() - 1,
        full.len()
    )
    .into_bytes();
    response.extend_from_slice(suffix);
    response
}

fn unsatisfiable_response() -> Vec<u8> {
    b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        .to_vec()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn full_download_writes_identical_bytes() {
    let body = payload(100_000);
    let served = body.clone();
    let base = spawn_server(move |req| full_response(&req.method, &served));

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");
    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    let mut last = (0, None);
    transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            true,
            |downloaded, total| last = (downloaded, total),
            &token,
        )
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), body);
    assert_eq!(last, (body.len() as u64, Some(body.len() as u64)));
}

#[test]
fn resume_requests_a_range_and_appends_the_suffix() {
    let body = payload(100_000);
    let served = body.clone();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);
    let base = spawn_server(move |req| {
        log.lock().push(req.clone());
        match req.range_start {
            Some(start) => partial_response(&served, start),
            None => full_response(&req.method, &served),
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");
    fs::write(&dest, &body[..40_000]).unwrap();

    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            true,
            |_, _| {},
            &token,
        )
        .unwrap();

    // The resumed file is byte-identical to a fresh download.
    assert_eq!(fs::read(&dest).unwrap(), body);
    let requests = requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range_start, Some(40_000));
}

#[test]
fn ignored_range_restarts_from_zero() {
    let body = payload(50_000);
    let served = body.clone();
    // The server never honors ranges.
    let base = spawn_server(move |req| full_response(&req.method, &served));

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");
    fs::write(&dest, b"stale local prefix").unwrap();

    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            true,
            |_, _| {},
            &token,
        )
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), body);
}

#[test]
fn unsatisfiable_range_falls_back_to_a_full_download() {
    let body = payload(50_000);
    let served = body.clone();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);
    let base = spawn_server(move |req| {
        log.lock().push(req.clone());
        match req.range_start {
            Some(_) => unsatisfiable_response(),
            None => full_response(&req.method, &served),
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");
    fs::write(&dest, b"partial out of sync with the remote").unwrap();

    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            true,
            |_, _| {},
            &token,
        )
        .unwrap();

    assert_eq!(fs::read(&dest).unwrap(), body);
    let requests = requests.lock();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].range_start.is_some());
    assert!(requests[1].range_start.is_none());
}

#[test]
fn cancelled_fresh_fetch_leaves_no_file() {
    let body = payload(10_000);
    let served = body.clone();
    let base = spawn_server(move |req| full_response(&req.method, &served));

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");

    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let err = transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            false,
            |_, _| {},
            &token,
        )
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!dest.exists());
}

#[test]
fn cancelled_resume_keeps_the_partial_file() {
    let body = payload(10_000);
    let served = body.clone();
    let base = spawn_server(move |req| match req.range_start {
        Some(start) => partial_response(&served, start),
        None => full_response(&req.method, &served),
    });

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bundle.tar.bz2");
    fs::write(&dest, &body[..4_000]).unwrap();

    let transfer = TransferManager::new().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let err = transfer
        .fetch(
            &format!("{base}/bundle.tar.bz2"),
            &dest,
            true,
            |_, _| {},
            &token,
        )
        .unwrap_err();

    assert!(err.is_cancelled());
    // The partial survives untouched for the next resume attempt.
    assert_eq!(fs::read(&dest).unwrap(), &body[..4_000]);
}

fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tarball = builder.into_inner().unwrap();

    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tarball).unwrap();
    encoder.finish().unwrap()
}

fn states_for(events: &Receiver<AcquisitionEvent>, id: &str) -> Vec<AcquisitionState> {
    events
        .try_iter()
        .filter_map(|event| match event {
            AcquisitionEvent::StateChanged { model_id, state } if model_id == id => Some(state),
            _ => None,
        })
        .collect()
}

fn acquirer_for(
    root: &Path,
    descriptor: ModelDescriptor,
) -> (Acquirer, Receiver<AcquisitionEvent>) {
    let config = AcquirerConfig {
        models_root: root.join("models"),
        temp_root: root.join("archives"),
        catalog: Catalog::new(vec![descriptor]),
    };
    Acquirer::new(config).unwrap()
}

#[test]
fn stale_cached_archive_is_discarded_and_redownloaded() {
    let id = "stale-test";
    let archive_bytes = build_archive(&[
        ("stale-test/model.onnx", b"m".as_slice()),
        ("stale-test/tokens.txt", b"t".as_slice()),
    ]);
    let served = archive_bytes.clone();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);
    let base = spawn_server(move |req| {
        log.lock().push(req.clone());
        full_response(&req.method, &served)
    });

    let root = tempfile::tempdir().unwrap();
    let (acquirer, events) = acquirer_for(
        root.path(),
        ModelDescriptor {
            id: id.into(),
            family: ModelFamily::Paraformer,
            display_name: id.into(),
            approx_size_bytes: 0,
            source_url: format!("{base}/{id}.tar.bz2"),
        },
    );

    // A cached archive whose size disagrees with the HEAD probe.
    let archive_path = root.path().join("archives").join(format!("{id}.tar.bz2"));
    fs::write(&archive_path, b"stale bytes").unwrap();

    acquirer.ensure_blocking(id).unwrap();

    assert_eq!(fs::read(&archive_path).unwrap(), archive_bytes);
    assert!(acquirer.status(id).unwrap().installed);

    let states = states_for(&events, id);
    assert!(states.contains(&AcquisitionState::Downloading));
    assert!(!states.contains(&AcquisitionState::CachedArchiveValid));

    let requests = requests.lock();
    assert_eq!(requests[0].method, "HEAD");
    assert!(requests.iter().any(|r| r.method == "GET"));
}
