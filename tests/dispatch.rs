//! End-to-end dispatch tests: a real listener, a real dispatcher, and an
//! in-process spawner that answers worker traffic over actual sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tenantgate::config::Config;
use tenantgate::dispatcher::Dispatcher;
use tenantgate::proxy::GateServer;
use tenantgate::site::{BackendRecord, DomainRecord, SiteKind, SiteRecord, SiteSettings};
use tenantgate::stats::StatsCollector;
use tenantgate::store::Store;
use tenantgate::worker::{ControlMessage, ProcessHandle, ProcessSpawner, SpawnSpec, WorkerEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Spawner that binds a tiny HTTP echo server on the worker's assigned port
/// instead of forking a process.
struct EchoSpawner;

impl ProcessSpawner for EchoSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
        let port = spec
            .args
            .iter()
            .find_map(|a| a.strip_prefix("--port="))
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("spawn spec has no --port argument"))?;

        // Bind synchronously so the port is live before readiness is signaled.
        let std_listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
        std_listener.set_nonblocking(true)?;

        let (event_tx, event_rx) = mpsc::channel(32);
        let (signal_tx, mut signal_rx) = mpsc::channel(8);

        let _ = event_tx.try_send(WorkerEvent::Control(ControlMessage {
            ready: true,
            error: None,
        }));

        tokio::spawn(async move {
            let listener = TcpListener::from_std(std_listener).expect("tokio listener");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 4096];
                            let _ = stream.read(&mut buf).await;
                            let body = b"echo response";
                            let head = format!(
                                "HTTP/1.1 200 OK\r\nx-echo-backend: true\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                                body.len()
                            );
                            let _ = stream.write_all(head.as_bytes()).await;
                            let _ = stream.write_all(body).await;
                        });
                    }
                    _ = signal_rx.recv() => {
                        let _ = event_tx.send(WorkerEvent::Exited { code: Some(0) }).await;
                        break;
                    }
                }
            }
        });

        Ok(ProcessHandle {
            pid: std::process::id(),
            events: event_rx,
            signals: signal_tx,
        })
    }
}

struct Gate {
    dispatcher: Arc<Dispatcher>,
    _shutdown_tx: watch::Sender<bool>,
}

fn test_config(proxy_port: u16, worker_port_base: u16) -> Config {
    let mut config = Config::default();
    config.server.port = proxy_port;
    config.server.bind = "127.0.0.1".into();
    config.server.worker_port_base = worker_port_base;
    config.server.socket_dir = std::env::temp_dir()
        .join(format!("tenantgate-it-{proxy_port}"))
        .display()
        .to_string();
    config
}

async fn start_gate(proxy_port: u16, worker_port_base: u16) -> Gate {
    start_gate_with(test_config(proxy_port, worker_port_base)).await
}

async fn start_gate_with(config: Config) -> Gate {
    let proxy_port = config.server.port;

    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while activity_rx.recv().await.is_some() {} });

    let dispatcher =
        Dispatcher::new(Arc::new(config), Arc::new(EchoSpawner), activity_tx).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr: SocketAddr = format!("127.0.0.1:{proxy_port}").parse().unwrap();
    let server = GateServer::new(addr, Arc::clone(&dispatcher), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(
        wait_for_port(proxy_port, Duration::from_secs(2)).await,
        "listener did not come up on {proxy_port}"
    );

    Gate {
        dispatcher,
        _shutdown_tx: shutdown_tx,
    }
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send a raw HTTP request and collect the full response
async fn http_raw(port: u16, request: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn node_record(hostname: &str) -> SiteRecord {
    SiteRecord {
        id: "node-1".into(),
        name: "node-app".into(),
        domains: vec![DomainRecord {
            hostnames: vec![hostname.into()],
            ..Default::default()
        }],
        backend: BackendRecord::Node {
            script: "app/server.js".into(),
            args: vec![],
            env: HashMap::new(),
            minimum_processes: Some(1),
            maximum_processes: Some(1),
            wait_for_ready: Some(true),
            use_socket: false,
            runtime: None,
        },
        settings: SiteSettings::default(),
    }
}

#[tokio::test]
async fn test_dispatch_through_worker_pool() {
    let gate = start_gate(40810, 40900).await;
    gate.dispatcher
        .apply_records(vec![node_record("app.local")])
        .await;

    // First request spawns the worker and waits for readiness.
    let response = http_get_with_host(40810, "/echo", "app.local").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response.contains("echo response"), "Response: {}", response);
    assert!(
        response.to_lowercase().contains("x-echo-backend: true"),
        "Response: {}",
        response
    );

    // Second request goes to the already-running worker.
    let response2 = http_get_with_host(40810, "/again", "app.local").await.unwrap();
    assert!(response2.contains("200 OK"), "Response: {}", response2);

    // Exactly one worker served both hits.
    let site = gate.dispatcher.site_by_id("node-1").unwrap();
    match site.kind().as_ref() {
        SiteKind::Node(pool) => assert_eq!(pool.running_count(), 1),
        _ => panic!("expected a node site"),
    }
    assert_eq!(gate.dispatcher.hit_count(), 2);
    assert_eq!(gate.dispatcher.active_sites(), 1);

    // A sampling pass over the live dispatcher sees the site and worker.
    let store = Arc::new(Store::open_in_memory().unwrap());
    let collector = StatsCollector::new(
        gate.dispatcher.config().stats.clone(),
        Arc::clone(&gate.dispatcher),
        store,
    );
    collector.sample_once();
    let sample = *collector.global_series().last().unwrap();
    assert_eq!(sample.hits, 2);
    assert_eq!(sample.workers, 1);
    assert_eq!(sample.active_sites, 1);
    // Both requests plus the probe connections from wait_for_port.
    assert!(sample.connections >= 2, "connections: {}", sample.connections);
}

#[tokio::test]
async fn test_forwarded_marker_returns_loop_detected() {
    let gate = start_gate(40811, 40910).await;
    gate.dispatcher
        .apply_records(vec![node_record("loop.local")])
        .await;

    // A request already carrying our forwarding marker must never be
    // forwarded again.
    let request = "GET / HTTP/1.1\r\nHost: loop.local\r\nx-tenantgate-forwarded: 1\r\nConnection: close\r\n\r\n";
    let response = http_raw(40811, request).await.unwrap();
    assert!(response.contains("508"), "Response: {}", response);
}

#[tokio::test]
async fn test_plaintext_upgrade_refused_when_tls_enabled() {
    let mut config = test_config(40816, 40970);
    config.tls.email = Some("admin@gate.test".into());
    let gate = start_gate_with(config).await;
    gate.dispatcher
        .apply_records(vec![node_record("ws.local")])
        .await;

    // With an HTTPS listener configured, an upgrade over the insecure
    // listener is refused rather than forwarded.
    let request = "GET /socket HTTP/1.1\r\nHost: ws.local\r\nConnection: Upgrade, close\r\nUpgrade: websocket\r\n\r\n";
    let response = http_raw(40816, request).await.unwrap();
    assert!(response.contains("403"), "Response: {}", response);
    assert!(
        response.contains("INSECURE_UPGRADE_REFUSED"),
        "Response: {}",
        response
    );
}

#[tokio::test]
async fn test_unknown_host_returns_404() {
    let _gate = start_gate(40812, 40920).await;

    let response = http_get_with_host(40812, "/", "nobody.local").await.unwrap();
    assert!(
        response.contains("404") || response.contains("Not Found"),
        "Response: {}",
        response
    );
}

#[tokio::test]
async fn test_missing_host_header_returns_400() {
    let _gate = start_gate(40813, 40930).await;

    let request = "GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
    let response = http_raw(40813, request).await.unwrap();
    assert!(
        response.contains("400") || response.contains("Bad Request"),
        "Response: {}",
        response
    );
}

#[tokio::test]
async fn test_static_site_serving_and_traversal() {
    let gate = start_gate(40814, 40940).await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>static ok</h1>").unwrap();
    std::fs::write(dir.path().join("data.txt"), "plain data").unwrap();

    gate.dispatcher
        .apply_records(vec![SiteRecord {
            id: "static-1".into(),
            name: "docs".into(),
            domains: vec![DomainRecord {
                hostnames: vec!["docs.local".into()],
                ..Default::default()
            }],
            backend: BackendRecord::Static {
                root: dir.path().to_path_buf(),
            },
            settings: SiteSettings::default(),
        }])
        .await;

    let response = http_get_with_host(40814, "/", "docs.local").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response.contains("static ok"), "Response: {}", response);

    let response = http_get_with_host(40814, "/data.txt", "docs.local").await.unwrap();
    assert!(response.contains("plain data"), "Response: {}", response);

    let response = http_get_with_host(40814, "/missing.txt", "docs.local").await.unwrap();
    assert!(response.contains("404"), "Response: {}", response);

    // Dot segments must not escape the static root.
    let response = http_get_with_host(40814, "/../Cargo.toml", "docs.local").await.unwrap();
    assert!(response.contains("404"), "Response: {}", response);
}

#[tokio::test]
async fn test_redirect_site_behind_basic_auth() {
    let gate = start_gate(40815, 40950).await;

    gate.dispatcher
        .apply_records(vec![SiteRecord {
            id: "redir-1".into(),
            name: "landing".into(),
            domains: vec![DomainRecord {
                hostnames: vec!["old.local".into()],
                ..Default::default()
            }],
            backend: BackendRecord::Redirect {
                target: "https://example.com/landing".into(),
                permanent: true,
            },
            settings: SiteSettings {
                basic_auth: vec!["admin:secret".into()],
                ..Default::default()
            },
        }])
        .await;

    // No credentials: challenged.
    let response = http_get_with_host(40815, "/", "old.local").await.unwrap();
    assert!(response.contains("401"), "Response: {}", response);
    assert!(
        response.to_lowercase().contains("www-authenticate"),
        "Response: {}",
        response
    );

    // Correct credentials pass through to the redirect.
    let request = "GET / HTTP/1.1\r\nHost: old.local\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\nConnection: close\r\n\r\n";
    let response = http_raw(40815, request).await.unwrap();
    assert!(response.contains("301"), "Response: {}", response);
    assert!(
        response
            .to_lowercase()
            .contains("location: https://example.com/landing"),
        "Response: {}",
        response
    );
}
