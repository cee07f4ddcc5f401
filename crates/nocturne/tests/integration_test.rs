use nocturne::http::{ERROR_400_FORM, ERROR_403_FORM, ERROR_404_FORM};
use nocturne::{MetricsSnapshot, NocturneResult, Server, ServerMetrics, ShutdownHandle};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const INDEX: &str = "<html><body>nocturne</body></html>";
const BIG_LEN: usize = 1 << 20;

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    metrics: Arc<ServerMetrics>,
    thread: Option<JoinHandle<NocturneResult<()>>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    fn start(idle_timeout: Option<Duration>, tick: Duration) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), INDEX).unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        fs::write(root.path().join("sub/page.html"), "sub page").unwrap();
        let big: Vec<u8> = (0..BIG_LEN).map(|i| (i % 251) as u8).collect();
        fs::write(root.path().join("big.bin"), big).unwrap();
        let secret = root.path().join("secret.html");
        fs::write(&secret, "secret").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let mut reactor = Server::bind("127.0.0.1", 0)
            .doc_root(root.path())
            .workers(4)
            .max_requests(64)
            .max_connections(4096)
            .idle_timeout(idle_timeout)
            .tick_interval(tick)
            .build()
            .unwrap();

        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let metrics = reactor.metrics();
        let thread = thread::spawn(move || reactor.run());

        Self {
            addr,
            handle,
            metrics,
            thread: Some(thread),
            _root: root,
        }
    }

    fn plain() -> Self {
        Self::start(None, Duration::from_secs(5))
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn stop(mut self) -> MetricsSnapshot {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
        self.metrics.snapshot()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

/// Read one response: status line, headers, then exactly Content-length bytes.
fn read_response(reader: &mut BufReader<TcpStream>) -> (String, Vec<u8>) {
    let mut head = String::new();
    let mut content_len = 0usize;
    loop {
        let mut line = String::new();
        assert!(reader.read_line(&mut line).unwrap() > 0, "connection closed mid-response");
        if let Some(value) = line.strip_prefix("Content-length: ") {
            content_len = value.trim().parse().unwrap();
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    let mut body = vec![0u8; content_len];
    reader.read_exact(&mut body).unwrap();
    (head, body)
}

fn fetch(server: &TestServer, request: &[u8]) -> String {
    let mut stream = server.connect();
    stream.write_all(request).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn serves_file_with_exact_length() {
    let server = TestServer::plain();
    let response = fetch(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    let expected = format!(
        "HTTP/1.1 200 OK\r\nContent-length: {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n{}",
        INDEX.len(),
        INDEX
    );
    assert_eq!(response, expected);

    let snap = server.stop();
    assert_eq!(snap.requests, 1);
    assert_eq!(snap.active_conns, 0);
}

#[test]
fn error_statuses_carry_canned_bodies() {
    let server = TestServer::plain();

    let cases: [(&[u8], &str, &str); 6] = [
        (b"GET /missing.html HTTP/1.1\r\n\r\n", "404 Not Found", ERROR_404_FORM),
        (b"GET /sub HTTP/1.1\r\n\r\n", "400 Bad Request", ERROR_400_FORM),
        (b"POST /index.html HTTP/1.1\r\n\r\n", "400 Bad Request", ERROR_400_FORM),
        (b"GET /index.html HTTP/1.0\r\n\r\n", "400 Bad Request", ERROR_400_FORM),
        (b"GET /secret.html HTTP/1.1\r\n\r\n", "403 Forbidden", ERROR_403_FORM),
        (b"GET /../etc/passwd HTTP/1.1\r\n\r\n", "403 Forbidden", ERROR_403_FORM),
    ];

    for (request, status, body) in cases {
        let response = fetch(&server, request);
        assert!(
            response.starts_with(&format!("HTTP/1.1 {}\r\n", status)),
            "unexpected response {:?}",
            response
        );
        assert!(response.contains(&format!("Content-length: {}\r\n", body.len())));
        assert!(response.ends_with(body));
    }
}

#[test]
fn absolute_form_url_is_served() {
    let server = TestServer::plain();
    let response = fetch(&server, b"GET http://localhost/sub/page.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nsub page"));
}

#[test]
fn keep_alive_serves_several_requests_on_one_connection() {
    let server = TestServer::plain();
    let mut stream = server.connect();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    for _ in 0..3 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut reader);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, INDEX.as_bytes());
    }

    // a final non-keep-alive request ends the connection
    stream.write_all(b"GET /sub/page.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut reader);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, b"sub page");
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert_eq!(server.stop().requests, 4);
}

#[test]
fn request_delivered_one_byte_at_a_time() {
    let server = TestServer::plain();
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();

    for byte in b"GET /index.html HTTP/1.1\r\nHost: slow\r\n\r\n" {
        stream.write_all(std::slice::from_ref(byte)).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(INDEX));
}

#[test]
fn body_split_across_reads_completes_the_request() {
    let server = TestServer::plain();
    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nContent-Length: 5\r\n\r\nhe")
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"llo").unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn large_file_survives_partial_writes() {
    let server = TestServer::plain();
    let mut stream = server.connect();
    stream.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();

    let mut reader = BufReader::new(stream);
    let (head, body) = read_response(&mut reader);
    assert!(head.contains(&format!("Content-length: {}\r\n", BIG_LEN)));
    assert_eq!(body.len(), BIG_LEN);
    assert!(body.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));

    let snap = server.stop();
    assert!(snap.bytes_sent >= BIG_LEN);
}

#[test]
fn oversized_request_is_dropped_without_a_response() {
    let server = TestServer::plain();
    let mut stream = server.connect();
    stream.write_all(&vec![b'a'; 2048]).unwrap();

    let mut buf = [0u8; 64];
    // closed either cleanly or with a reset, but never answered
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
    }
}

#[test]
fn concurrent_clients_never_share_a_connection() {
    const CLIENTS: usize = 16;
    const REQUESTS: usize = 20;

    let server = TestServer::plain();
    let addr = server.addr;

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                for _ in 0..REQUESTS {
                    stream
                        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                        .unwrap();
                    let (head, body) = read_response(&mut reader);
                    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
                    assert_eq!(body, INDEX.as_bytes());
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    let snap = server.stop();
    assert_eq!(snap.requests, CLIENTS * REQUESTS);
    assert_eq!(snap.ownership_conflicts, 0);
    assert_eq!(snap.active_conns, 0);
}

#[test]
fn idle_connection_is_closed_by_the_timer() {
    let server = TestServer::start(Some(Duration::from_millis(300)), Duration::from_millis(100));
    let mut stream = server.connect();

    let started = Instant::now();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(5));

    let snap = server.stop();
    assert_eq!(snap.active_conns, 0);
    assert_eq!(snap.requests, 0);
}

#[test]
fn active_connection_outlives_the_idle_timeout() {
    let server = TestServer::start(Some(Duration::from_millis(500)), Duration::from_millis(100));
    let mut stream = server.connect();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    // keep talking for longer than the timeout
    for _ in 0..6 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut reader);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        thread::sleep(Duration::from_millis(150));
    }
}

#[test]
fn shutdown_handle_stops_a_busy_server() {
    let server = TestServer::plain();
    let _idle: Vec<TcpStream> = (0..4).map(|_| server.connect()).collect();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.metrics.snapshot().active_conns < 4 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let snap = server.stop();
    assert_eq!(snap.active_conns, 0);
}
