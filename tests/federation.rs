mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use ryftgate::core::config::Config;
use ryftgate::core::error::ErrorKind;
use ryftgate::core::stats::Statistics;
use ryftgate::core::types::{Index, Record};
use ryftgate::query::Options;
use ryftgate::search::SearchEvent;
use ryftgate::search::federation::{Coordinator, ServiceNode, StaticDirectory};
use ryftgate::search::scheduler::{Scheduler, SearchRequest};
use common::setup;

/// One-shot HTTP peer answering with `body`, returns its port and the
/// request it received.
fn spawn_peer(body: String) -> (u16, mpsc::Receiver<String>) {
    let (req_tx, req_rx) = mpsc::channel();
    let (port_tx, port_rx) = mpsc::channel();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            port_tx.send(listener.local_addr().unwrap().port()).unwrap();

            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
            }
            req_tx.send(String::from_utf8_lossy(&req).into_owned()).unwrap();

            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n";
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(body.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
        });
    });
    (port_rx.recv().unwrap(), req_rx)
}

fn peer_body() -> String {
    let events = [
        SearchEvent::Record(Record::new(Index::new("2.txt", 0, 5, 0), &b"hello"[..])),
        SearchEvent::Record(Record::new(Index::new("2.txt", 10, 5, 0), &b"hello"[..])),
        SearchEvent::Stat(Statistics::new(2, 20, 1, 1)),
    ];
    events
        .iter()
        .map(|e| format!("{}\n", serde_json::to_string(e).unwrap()))
        .collect()
}

fn coordinator(base: &Config, scheduler: Arc<Scheduler>, remote_port: u16) -> Arc<Coordinator> {
    coordinator_with(base, scheduler, remote_port, StaticDirectory::default())
}

fn coordinator_with(base: &Config, scheduler: Arc<Scheduler>, remote_port: u16, directory: StaticDirectory) -> Arc<Coordinator> {
    let mut directory = directory;
    directory.services.insert(
        base.federation.service_name.clone(),
        vec![
            ServiceNode {
                node: "n1".to_string(),
                address: base.local_host.clone(),
                port: base.listen_port,
                tags: vec!["a".to_string()],
            },
            ServiceNode {
                node: "n2".to_string(),
                address: "127.0.0.1".to_string(),
                port: remote_port,
                tags: vec!["b".to_string()],
            },
        ],
    );
    let config = Arc::new(base.clone());
    Arc::new(Coordinator::new(config, Arc::new(directory), scheduler).unwrap())
}

fn request() -> SearchRequest {
    SearchRequest {
        query: "hello".to_string(),
        files: vec!["1.txt".to_string()],
        options: Options::default(),
        ..SearchRequest::default()
    }
}

#[test]
fn test_local_and_remote() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _backend, scheduler) = setup(dir.path(), -1);
    let (port, requests) = spawn_peer(peer_body());
    let coord = coordinator(&config, scheduler, port);

    let out = coord.search(request()).finish();
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.records.len(), 7);

    let remote = format!("http://127.0.0.1:{}", port);
    let local = out.records.iter().filter(|r| r.index.host == "node-1").count();
    let peer: Vec<_> = out.records.iter().filter(|r| r.index.host == remote).collect();
    assert_eq!(local, 5);
    assert_eq!(peer.len(), 2);
    assert_eq!(peer[0].index.file, "2.txt");

    // matches are summed over both nodes
    let stat = out.stat.unwrap();
    assert_eq!(stat.matches, 7);
    assert_eq!(stat.details.len(), 2);

    let req = requests.recv().unwrap();
    let line = req.lines().next().unwrap();
    assert!(line.starts_with("GET /search?query=hello&file=1.txt&"), "{}", line);
    for param in ["local=true", "stats=true", "stream=true", "format=raw", "cs=true"] {
        assert!(line.contains(param), "{} in {}", param, line);
    }
}

#[test]
fn test_remote_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _backend, scheduler) = setup(dir.path(), -1);

    // nobody listens there any more
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let coord = coordinator(&config, scheduler, port);

    let out = coord.search(request()).finish();
    assert_eq!(out.records.len(), 5);
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.errors[0].kind, ErrorKind::Backend);
    assert_eq!(out.errors[0].host, format!("http://127.0.0.1:{}", port));
    assert_eq!(out.stat.unwrap().matches, 5);
}

#[test]
fn test_overlapping_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _backend, scheduler) = setup(dir.path(), -1);
    let (port, requests) = spawn_peer(peer_body());

    // 1.txt falls under both masks, so both tags have to be covered
    let mut directory = StaticDirectory::default();
    directory.kv.insert("partitions/*".to_string(), "a".to_string());
    directory.kv.insert("partitions/*.txt".to_string(), "b".to_string());
    let coord = coordinator_with(&config, scheduler, port, directory);

    let branches = coord.plan(&["1.txt".to_string()]).unwrap();
    assert_eq!(branches.len(), 2);

    let out = coord.search(request()).finish();
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.records.len(), 7);
    assert_eq!(out.stat.unwrap().matches, 7);
    assert!(requests.recv().unwrap().starts_with("GET /search?"));
}

#[test]
fn test_single_partition() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _backend, scheduler) = setup(dir.path(), -1);
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    let mut directory = StaticDirectory::default();
    directory.kv.insert("partitions/*.txt".to_string(), "a".to_string());
    directory.kv.insert("partitions/*.bin".to_string(), "b".to_string());
    let coord = coordinator_with(&config, scheduler, port, directory);

    // only the local node holds "a", the dead peer is never asked
    let out = coord.search(request()).finish();
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.records.len(), 5);
}
