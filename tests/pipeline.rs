//! End-to-end exercises of the pipeline against real sockets: a TCP
//! listener standing in for the line-protocol backend and a tiny_http
//! server standing in for the HTTP one.
extern crate emissary;
extern crate serde_json;
extern crate tiny_http;

use emissary::flattener::{FlattenerConfig, Operation};
use emissary::manager::{Manager, ManagerConfig};
use emissary::metric::{NumberPoint, TagMap, TextPoint};
use emissary::transport::{Backend, HttpConfig, HttpTransport, LineConfig, LineTransport,
                          Transport};
use serde_json::Value;
use std::io::Read;
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn line_pipeline_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut line_config = LineConfig::default();
    line_config.reconnection_timeout_ms = 50;
    let transport = LineTransport::new(line_config).unwrap();

    let mut default_tags = TagMap::new();
    default_tags.insert("env", "prod");
    let config = ManagerConfig {
        backend: Some(Backend::new("127.0.0.1", port)),
        default_tags: default_tags,
        // Long cycle: the only flush is the one shutdown forces, so the
        // aggregated sends below deterministically share a cycle.
        flattener: Some(FlattenerConfig { cycle_ms: 3_600_000 }),
    };
    let manager = Manager::new(config, Some(Box::new(transport))).unwrap();

    manager
        .send(NumberPoint::new("cpu.idle", 98.5).timestamp(10))
        .unwrap();
    manager
        .send_aggregated(
            Operation::Sum,
            NumberPoint::new("reqs", 5.0).timestamp(10).overlay_tag("a", "1"),
        )
        .unwrap();
    manager
        .send_aggregated(
            Operation::Sum,
            NumberPoint::new("reqs", 3.0).timestamp(10).overlay_tag("a", "1"),
        )
        .unwrap();
    manager.shutdown();

    // The sender closes the socket once it has drained, so read-to-EOF
    // sees everything that was delivered.
    let (mut conn, _) = listener.accept().unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut seen = String::new();
    let mut buf = [0u8; 4096];
    loop {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) => panic!("read from transport failed: {}", e),
        }
    }
    assert!(seen.contains("put cpu.idle 10 98.5 env=prod\n"), "{:?}", seen);
    assert!(seen.contains("put reqs 10 8 a=1 env=prod\n"), "{:?}", seen);
}

fn spawn_http_backend(status: u16) -> (u16, mpsc::Receiver<String>) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || loop {
        let mut request = match server.recv() {
            Ok(request) => request,
            Err(_) => return,
        };
        let mut body = String::new();
        request.as_reader().read_to_string(&mut body).unwrap();
        if tx.send(body).is_err() {
            return;
        }
        let _ = request.respond(tiny_http::Response::from_string("").with_status_code(status));
    });
    (port, rx)
}

fn http_transport(port: u16, expected_status: u16) -> HttpTransport {
    let mut config = HttpConfig::default();
    config.batch_interval_ms = 50;
    config.expected_status = expected_status;
    let mut transport = HttpTransport::new(config).unwrap();
    transport
        .configure_backend(&Backend::new("127.0.0.1", port))
        .unwrap();
    transport
}

#[test]
fn http_delivers_json_batches() {
    let (port, bodies) = spawn_http_backend(204);
    let mut transport = http_transport(port, 204);

    transport
        .enqueue(NumberPoint::new("cpu.idle", 98.5).timestamp(10).into())
        .unwrap();
    transport
        .enqueue(TextPoint::new("deploy.note", "shipped").timestamp(11).into())
        .unwrap();

    // Both points may share a batch or straddle a tick; collect until both
    // have shown up.
    let mut number_seen = false;
    let mut text_seen = false;
    while !(number_seen && text_seen) {
        let body = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        let batch = parsed.as_array().unwrap();
        for obj in batch {
            if obj["metric"] == "cpu.idle" {
                assert_eq!(obj["value"], 98.5);
                assert_eq!(obj["timestamp"], 10);
                number_seen = true;
            }
            if obj["metric"] == "deploy.note" {
                assert_eq!(obj["text"], "shipped");
                text_seen = true;
            }
        }
    }
    transport.close();
}

#[test]
fn http_unexpected_status_is_not_retried() {
    // Backend always answers 500; the transport expects 204.
    let (port, bodies) = spawn_http_backend(500);
    let transport = http_transport(port, 204);

    transport
        .enqueue(NumberPoint::new("m1", 1.0).timestamp(1).into())
        .unwrap();
    let first = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first.contains("m1"));

    // No retry: several intervals pass with nothing new enqueued and the
    // backend hears nothing further.
    assert!(bodies.recv_timeout(Duration::from_millis(300)).is_err());

    // The next tick carries only newly arrived items.
    transport
        .enqueue(NumberPoint::new("m2", 2.0).timestamp(2).into())
        .unwrap();
    let second = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(second.contains("m2"));
    assert!(!second.contains("m1"));

    let mut transport = transport;
    transport.close();
}
