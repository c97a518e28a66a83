use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use muninn_servent_lib::{
    EngineConfig, ErrorKind, HeaderVerdict, HttpClientError, HttpEngine, RequestEvents,
    RequestOptions, RequestState, Unmetered, Verb, Verdict,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Headers(u16),
    Data(Vec<u8>),
    Error(String),
}

type Log = Arc<Mutex<Vec<Event>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn events(log: &Log) -> Vec<Event> {
    log.lock().unwrap().clone()
}

/// Hooks that record everything they observe.
fn recorder(log: &Log) -> RequestEvents {
    let headers_log = log.clone();
    let data_log = log.clone();
    let error_log = log.clone();
    RequestEvents::new(move |e: &HttpClientError| {
        error_log.lock().unwrap().push(Event::Error(e.to_string()));
    })
    .on_headers(move |_headers, code, _message| {
        headers_log.lock().unwrap().push(Event::Headers(code));
        HeaderVerdict::Continue
    })
    .on_data(move |data| {
        data_log.lock().unwrap().push(Event::Data(data.to_vec()));
        Verdict::Continue
    })
}

fn engine() -> HttpEngine {
    let cfg = EngineConfig {
        sweep_ms: 50,
        ..EngineConfig::default()
    };
    HttpEngine::new(cfg, Arc::new(Unmetered))
}

/// Accept one connection, read the request head, send `response`, close.
/// Resolves to the received request bytes.
async fn serve_once(response: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_head(&mut socket).await;
        socket.write_all(&response).await.unwrap();
        socket.shutdown().await.ok();
        request
    });
    (addr, handle)
}

/// Accept one connection, read the request head, then stall until dropped.
async fn serve_stalled() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });
    (addr, handle)
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    request
}

/// Wait until the hooks report a terminal event (error or end of stream).
async fn wait_done(log: &Log) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let events = log.lock().unwrap();
                let done = events.iter().any(|e| {
                    matches!(e, Event::Error(_)) || matches!(e, Event::Data(d) if d.is_empty())
                });
                if done {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request did not finish in time");
}

fn body_of(events: &[Event]) -> Vec<u8> {
    let mut body = Vec::new();
    for e in events {
        if let Event::Data(d) = e {
            body.extend_from_slice(d);
        }
    }
    body
}

#[tokio::test]
async fn get_delivers_headers_then_body_then_eof() {
    let engine = engine();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Thing: yes\r\n\r\nhello".to_vec();
    let (addr, server) = serve_once(response).await;

    let log = new_log();
    let handle = engine
        .get(&format!("http://{addr}/file.bin"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    let seen = events(&log);
    assert_eq!(seen[0], Event::Headers(200));
    assert_eq!(body_of(&seen), b"hello");
    assert_eq!(*seen.last().unwrap(), Event::Data(Vec::new()));
    assert!(!seen.iter().any(|e| matches!(e, Event::Error(_))));

    let request = String::from_utf8(server.await.unwrap()).unwrap();
    assert!(request.starts_with("GET /file.bin HTTP/1.1\r\n"));
    assert!(request.contains(&format!("Host: {addr}\r\n")));
    assert!(request.contains("Connection: close\r\n"));
    assert!(request.ends_with("\r\n\r\n"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), RequestState::Removed);
}

#[tokio::test]
async fn redirect_is_invisible_to_the_caller() {
    let engine = engine();
    let final_response = b"HTTP/1.1 200 OK\r\n\r\nredirected".to_vec();
    let (addr2, server2) = serve_once(final_response).await;
    let hop = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: http://{addr2}/new\r\nConnection: close\r\n\r\n"
    );
    let (addr1, server1) = serve_once(hop.into_bytes()).await;

    let log = new_log();
    let opts = RequestOptions {
        allow_redirects: true,
        ..RequestOptions::default()
    };
    let handle = engine
        .request(
            Verb::Get,
            &format!("http://{addr1}/old"),
            recorder(&log),
            opts,
        )
        .unwrap();
    wait_done(&log).await;

    // The caller sees one on_headers, for the final hop only.
    let seen = events(&log);
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, Event::Headers(_)))
            .collect::<Vec<_>>(),
        vec![&Event::Headers(200)]
    );
    assert_eq!(body_of(&seen), b"redirected");
    assert!(!seen.iter().any(|e| matches!(e, Event::Error(_))));

    server1.await.unwrap();
    let request2 = String::from_utf8(server2.await.unwrap()).unwrap();
    assert!(request2.starts_with("GET /new HTTP/1.1\r\n"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), RequestState::Removed);
}

#[tokio::test]
async fn redirect_without_permission_is_an_error() {
    let engine = engine();
    let (addr, _server) = serve_once(
        b"HTTP/1.1 301 Moved\r\nLocation: http://example.net/x\r\n\r\n".to_vec(),
    )
    .await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/old"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    let seen = events(&log);
    assert_eq!(seen[0], Event::Headers(301));
    assert_eq!(
        *seen.last().unwrap(),
        Event::Error(ErrorKind::Redirected.to_string())
    );
}

#[tokio::test]
async fn redirect_without_location_is_an_error() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 301 Moved\r\n\r\n".to_vec()).await;

    let log = new_log();
    let opts = RequestOptions {
        allow_redirects: true,
        ..RequestOptions::default()
    };
    engine
        .request(
            Verb::Get,
            &format!("http://{addr}/old"),
            recorder(&log),
            opts,
        )
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        *events(&log).last().unwrap(),
        Event::Error(ErrorKind::NoLocation.to_string())
    );
}

#[tokio::test]
async fn nested_redirects_are_rejected() {
    let engine = engine();
    let (addr3, _s3) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nnever seen".to_vec()).await;
    let hop2 = format!("HTTP/1.1 301 Moved\r\nLocation: http://{addr3}/c\r\n\r\n");
    let (addr2, _s2) = serve_once(hop2.into_bytes()).await;
    let hop1 = format!("HTTP/1.1 301 Moved\r\nLocation: http://{addr2}/b\r\n\r\n");
    let (addr1, _s1) = serve_once(hop1.into_bytes()).await;

    let log = new_log();
    let opts = RequestOptions {
        allow_redirects: true,
        ..RequestOptions::default()
    };
    engine
        .request(
            Verb::Get,
            &format!("http://{addr1}/a"),
            recorder(&log),
            opts,
        )
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        *events(&log).last().unwrap(),
        Event::Error(ErrorKind::Nested.to_string())
    );
    assert!(body_of(&events(&log)).is_empty());
}

#[tokio::test]
async fn cancel_reports_exactly_once_and_goes_quiet() {
    let engine = engine();
    let (addr, _server) = serve_stalled().await;

    let log = new_log();
    let handle = engine
        .get(&format!("http://{addr}/slow"), recorder(&log))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.cancel();
    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Cancelled.to_string())]
    );
    assert_eq!(handle.state(), RequestState::Removed);

    // A second cancel is a no-op, and nothing else ever arrives.
    handle.cancel();
    handle.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Cancelled.to_string())]
    );
}

#[tokio::test]
async fn missing_data_hook_means_close_after_headers() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nbody".to_vec()).await;

    let log = new_log();
    let headers_log = log.clone();
    let error_log = log.clone();
    let events_in = RequestEvents::new(move |e: &HttpClientError| {
        error_log.lock().unwrap().push(Event::Error(e.to_string()));
    })
    .on_headers(move |_h, code, _m| {
        headers_log.lock().unwrap().push(Event::Headers(code));
        HeaderVerdict::Continue
    });
    engine
        .get(&format!("http://{addr}/head-only"), events_in)
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![
            Event::Headers(200),
            Event::Error(ErrorKind::Closed.to_string()),
        ]
    );
}

#[tokio::test]
async fn eof_before_headers_is_reported() {
    let engine = engine();
    let (addr, _server) = serve_once(Vec::new()).await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/gone"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Eof.to_string())]
    );
}

#[tokio::test]
async fn unparseable_status_line_is_reported() {
    let engine = engine();
    let (addr, _server) = serve_once(b"how about no\r\n\r\n".to_vec()).await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/weird"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::BadStatus.to_string())]
    );
}

#[tokio::test]
async fn http_failure_carries_code_and_message() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()).await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/missing"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![
            Event::Headers(404),
            Event::Error("HTTP 404 Not Found".to_string()),
        ]
    );
}

#[tokio::test]
async fn stalled_exchange_times_out() {
    let cfg = EngineConfig {
        exchange_ms: 300,
        sweep_ms: 50,
        ..EngineConfig::default()
    };
    let engine = HttpEngine::new(cfg, Arc::new(Unmetered));
    let (addr, _server) = serve_stalled().await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/tarpit"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Timeout.to_string())]
    );
}

#[tokio::test]
async fn header_verdict_can_take_over() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nnot yours".to_vec()).await;

    let log = new_log();
    let headers_log = log.clone();
    let data_log = log.clone();
    let error_log = log.clone();
    let events_in = RequestEvents::new(move |e: &HttpClientError| {
        error_log.lock().unwrap().push(Event::Error(e.to_string()));
    })
    .on_headers(move |_h, code, _m| {
        headers_log.lock().unwrap().push(Event::Headers(code));
        HeaderVerdict::TakeOver
    })
    .on_data(move |d| {
        data_log.lock().unwrap().push(Event::Data(d.to_vec()));
        Verdict::Continue
    });
    let handle = engine
        .get(&format!("http://{addr}/mine"), events_in)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(events(&log), vec![Event::Headers(200)]);
    assert_eq!(handle.state(), RequestState::Removed);
}

#[tokio::test]
async fn data_verdict_cancel_surfaces_as_cancelled() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nstop right there".to_vec()).await;

    let log = new_log();
    let error_log = log.clone();
    let data_log = log.clone();
    let events_in = RequestEvents::new(move |e: &HttpClientError| {
        error_log.lock().unwrap().push(Event::Error(e.to_string()));
    })
    .on_data(move |d| {
        data_log.lock().unwrap().push(Event::Data(d.to_vec()));
        Verdict::Cancel
    });
    engine.get(&format!("http://{addr}/abort"), events_in).unwrap();
    wait_done(&log).await;

    let seen = events(&log);
    assert_eq!(
        *seen.last().unwrap(),
        Event::Error(ErrorKind::Cancelled.to_string())
    );
    // One data delivery, then nothing further.
    assert_eq!(
        seen.iter().filter(|e| matches!(e, Event::Data(_))).count(),
        1
    );
}

#[tokio::test]
async fn get_addr_bypasses_url_parsing() {
    let engine = engine();
    let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nok".to_vec()).await;

    let log = new_log();
    engine.get_addr("/direct", addr, recorder(&log));
    wait_done(&log).await;

    let request = String::from_utf8(server.await.unwrap()).unwrap();
    assert!(request.starts_with("GET /direct HTTP/1.1\r\n"));
    assert!(request.contains(&format!("Host: {addr}\r\n")));
}

#[tokio::test]
async fn bad_urls_fail_synchronously() {
    let engine = engine();
    let log = new_log();
    let result = engine.get("ftp://example.net/x", recorder(&log));
    assert!(matches!(result, Err(ErrorKind::BadUrl)));
    let result = engine.get("http://example.net", recorder(&log));
    assert!(matches!(result, Err(ErrorKind::BadUrl)));
}

#[tokio::test]
async fn request_builder_override_controls_the_wire() {
    let engine = engine();
    let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()).await;

    let log = new_log();
    let handle = engine
        .get(&format!("http://{addr}/x"), recorder(&log))
        .unwrap();
    // The driver task has not polled yet on this single-threaded runtime, so
    // the builder is installed before the connection goes out.
    handle.set_request_builder(|verb, path, host, port, _agent| {
        format!("{verb} {path} HTTP/1.1\r\nHost: {host}:{port}\r\nX-Custom: 1\r\n\r\n")
    });
    wait_done(&log).await;

    let request = String::from_utf8(server.await.unwrap()).unwrap();
    assert!(request.contains("X-Custom: 1\r\n"));
    assert!(!request.contains("User-Agent"));
}

#[tokio::test]
async fn state_changes_are_observable_in_order() {
    let engine = engine();
    let (addr, _server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\npayload".to_vec()).await;

    let log = new_log();
    let states: Arc<Mutex<Vec<RequestState>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = engine
        .get(&format!("http://{addr}/x"), recorder(&log))
        .unwrap();
    let seen_states = states.clone();
    handle.on_state_change(move |s| seen_states.lock().unwrap().push(s));
    wait_done(&log).await;

    let seen = states.lock().unwrap().clone();
    let expected = [
        RequestState::ReqSending,
        RequestState::ReqSent,
        RequestState::Headers,
        RequestState::Receiving,
    ];
    let mut it = seen.iter();
    for want in &expected {
        assert!(
            it.any(|s| s == want),
            "missing state {want:?} in {seen:?}"
        );
    }
}

#[tokio::test]
async fn opaque_data_travels_with_the_handle() {
    let engine = engine();
    let (addr, _server) = serve_stalled().await;

    let log = new_log();
    let handle = engine
        .get(&format!("http://{addr}/x"), recorder(&log))
        .unwrap();
    handle.set_opaque(Box::new(42u32));
    let opaque = handle.take_opaque().unwrap();
    assert_eq!(*opaque.downcast::<u32>().unwrap(), 42);
    handle.close();
}

#[tokio::test]
async fn shutdown_cancels_everything_outstanding() {
    let engine = engine();
    let (addr1, _s1) = serve_stalled().await;
    let (addr2, _s2) = serve_stalled().await;

    let log1 = new_log();
    let log2 = new_log();
    engine
        .get(&format!("http://{addr1}/a"), recorder(&log1))
        .unwrap();
    engine
        .get(&format!("http://{addr2}/b"), recorder(&log2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.shutdown();
    assert_eq!(
        events(&log1),
        vec![Event::Error(ErrorKind::Cancelled.to_string())]
    );
    assert_eq!(
        events(&log2),
        vec![Event::Error(ErrorKind::Cancelled.to_string())]
    );
    assert_eq!(engine.outstanding(), 0);
}

#[tokio::test]
async fn refused_connection_reports_conn_failed() {
    let engine = engine();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let log = new_log();
    engine
        .get(&format!("http://{addr}/nobody-home"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::ConnFailed.to_string())]
    );
}

#[tokio::test]
async fn oversized_header_block_is_rejected() {
    let cfg = EngineConfig {
        max_header_bytes: 256,
        sweep_ms: 50,
        ..EngineConfig::default()
    };
    let engine = HttpEngine::new(cfg, Arc::new(Unmetered));
    let filler = "X-Filler: ".to_string() + &"a".repeat(600) + "\r\n";
    let response = format!("HTTP/1.1 200 OK\r\n{filler}\r\n").into_bytes();
    let (addr, _server) = serve_once(response).await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/chatty"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Head2Big.to_string())]
    );
}

#[tokio::test]
async fn oversized_request_head_is_rejected() {
    let engine = engine();
    let (addr, _server) = serve_stalled().await;

    let log = new_log();
    let handle = engine
        .get(&format!("http://{addr}/x"), recorder(&log))
        .unwrap();
    handle.set_request_builder(|_verb, _path, _host, _port, _agent| "X".repeat(5000));
    wait_done(&log).await;

    assert_eq!(
        events(&log),
        vec![Event::Error(ErrorKind::Req2Big.to_string())]
    );
}

#[tokio::test]
async fn request_head_drains_through_a_tight_outbound_quota() {
    use muninn_servent_lib::TokenBucket;

    let cfg = EngineConfig {
        sweep_ms: 50,
        ..EngineConfig::default()
    };
    let engine = HttpEngine::new(cfg, Arc::new(TokenBucket::new(64 * 1024, 48)));
    let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\nok".to_vec()).await;

    let log = new_log();
    engine
        .get(&format!("http://{addr}/tiny"), recorder(&log))
        .unwrap();
    wait_done(&log).await;

    // The head went out in several quota windows but arrived whole.
    let request = String::from_utf8(server.await.unwrap()).unwrap();
    assert!(request.starts_with("GET /tiny HTTP/1.1\r\n"));
    assert!(request.ends_with("\r\n\r\n"));
    assert_eq!(body_of(&events(&log)), b"ok");
}
