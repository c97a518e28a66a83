//! Asynchronous HTTP client engine.
//!
//! Requests are driven entirely by the event loop: the engine connects,
//! pushes the request head through the outbound bandwidth quota, collects
//! the reply header block, then streams the body to the caller's data hook.
//! Redirections spawn a child request that reuses the caller's hooks, so
//! the chain is invisible from the outside. A periodic sweep expires
//! requests that stall and physically reclaims the ones already logically
//! freed.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use http::HeaderMap;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod error;
mod header_reader;
mod request;

pub use error::{ErrorKind, HeaderParseError, HttpClientError};
pub use request::{
    DataHook, ErrorHook, HeaderHook, HeaderVerdict, RequestBuilder, RequestEvents, RequestHandle,
    RequestInfo, RequestOptions, RequestState, StateHook, Verdict,
};

pub(crate) use crate::lock;

use crate::bandwidth::{limited_read, limited_write, BandwidthScheduler};
use crate::config::EngineConfig;
use crate::http::parse::parse_status;
use crate::http::url::parse_url;
use crate::http::Verb;
use header_reader::HeaderReadError;
use request::{format_request, Hooks, RequestInner};

/// The request head is formatted into a bounded buffer; anything larger is
/// refused with `Req2Big`.
const MAX_REQUEST_SIZE: usize = 2048;

const BODY_BUFFER_SIZE: usize = 8192;

/// The asynchronous HTTP engine.
///
/// One instance serves the whole process, created at boot inside a tokio
/// runtime and torn down at shutdown. Dropping the engine stops its sweeper;
/// outstanding requests are cancelled by [`shutdown`](Self::shutdown).
pub struct HttpEngine {
    inner: Arc<EngineShared>,
    sweeper: tokio::task::JoinHandle<()>,
}

pub(crate) struct EngineShared {
    cfg: EngineConfig,
    sched: Arc<dyn BandwidthScheduler>,
    /// Every live request, watched for timeouts.
    outstanding: Mutex<HashMap<u64, Arc<RequestInner>>>,
    /// Logically freed requests awaiting physical removal on the next tick.
    pending_free: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

enum ConnectTarget {
    Addr(SocketAddr),
    Name(String, u16),
}

struct CreateSpec {
    verb: Verb,
    url: String,
    host: String,
    port: u16,
    path: String,
    target: ConnectTarget,
    peer: Option<SocketAddr>,
}

impl HttpEngine {
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: EngineConfig, sched: Arc<dyn BandwidthScheduler>) -> Self {
        let inner = Arc::new(EngineShared {
            cfg,
            sched,
            outstanding: Mutex::new(HashMap::new()),
            pending_free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        let shared = inner.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.cfg.sweep_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                shared.sweep(Instant::now());
            }
        });
        Self { inner, sweeper }
    }

    /// Start a GET request on `url`.
    ///
    /// Without an `on_data` hook the connection is closed once the headers
    /// are read and the error hook observes `Closed`. Setup failures are
    /// returned directly; everything later arrives through the hooks.
    pub fn get(&self, url: &str, events: RequestEvents) -> Result<RequestHandle, ErrorKind> {
        self.request(Verb::Get, url, events, RequestOptions::default())
    }

    pub fn head(&self, url: &str, events: RequestEvents) -> Result<RequestHandle, ErrorKind> {
        self.request(Verb::Head, url, events, RequestOptions::default())
    }

    /// Start a request with explicit verb and options.
    pub fn request(
        &self,
        verb: Verb,
        url: &str,
        events: RequestEvents,
        opts: RequestOptions,
    ) -> Result<RequestHandle, ErrorKind> {
        let parsed = parse_url(url).map_err(|e| {
            debug!("invalid HTTP URL \"{url}\": {e}");
            ErrorKind::BadUrl
        })?;
        let spec = CreateSpec {
            verb,
            url: url.to_string(),
            host: parsed.host.to_string(),
            port: parsed.port,
            path: parsed.path.to_string(),
            target: ConnectTarget::Name(parsed.host.to_string(), parsed.port),
            peer: None,
        };
        Ok(self.spawn(spec, events, opts))
    }

    /// Same as [`get`](Self::get), but with the endpoint given explicitly;
    /// `path` is requested verbatim and URL parsing is bypassed.
    pub fn get_addr(&self, path: &str, addr: SocketAddr, events: RequestEvents) -> RequestHandle {
        self.request_addr(Verb::Get, path, addr, events, RequestOptions::default())
    }

    pub fn request_addr(
        &self,
        verb: Verb,
        path: &str,
        addr: SocketAddr,
        events: RequestEvents,
        opts: RequestOptions,
    ) -> RequestHandle {
        let spec = CreateSpec {
            verb,
            url: path.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            path: path.to_string(),
            target: ConnectTarget::Addr(addr),
            peer: Some(addr),
        };
        self.spawn(spec, events, opts)
    }

    fn spawn(&self, spec: CreateSpec, events: RequestEvents, opts: RequestOptions) -> RequestHandle {
        let (hooks, state_hook) = events.into_parts();
        let inner = self.inner.create(
            spec,
            hooks,
            state_hook,
            opts.allow_redirects,
            opts.opaque,
            opts.request_builder,
            None,
        );
        RequestHandle {
            inner,
            engine: self.inner.clone(),
        }
    }

    /// Number of requests not yet physically reclaimed.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.outstanding).len()
    }

    /// Cancel every outstanding request and stop the sweeper.
    pub fn shutdown(&self) {
        let snapshot: Vec<Arc<RequestInner>> =
            lock(&self.inner.outstanding).values().cloned().collect();
        for req in snapshot {
            if !req.freed.load(Ordering::SeqCst) {
                self.inner
                    .fail(&req, HttpClientError::Error(ErrorKind::Cancelled));
            }
        }
        self.inner.sweep(Instant::now());
        self.inner.shutdown.cancel();
    }
}

impl Drop for HttpEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.sweeper.abort();
    }
}

impl EngineShared {
    #[allow(clippy::too_many_arguments)]
    fn create(
        self: &Arc<Self>,
        spec: CreateSpec,
        hooks: Arc<Mutex<Hooks>>,
        state_hook: Option<StateHook>,
        allow_redirects: bool,
        opaque: Option<Box<dyn std::any::Any + Send>>,
        builder: Option<Arc<RequestBuilder>>,
        parent: Option<Arc<RequestInner>>,
    ) -> Arc<RequestInner> {
        let CreateSpec {
            verb,
            url,
            host,
            port,
            path,
            target,
            peer,
        } = spec;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(RequestInner {
            id,
            verb,
            url,
            host,
            port,
            path,
            state: Mutex::new(RequestState::Connecting),
            last_activity: Mutex::new(Instant::now()),
            freed: std::sync::atomic::AtomicBool::new(false),
            subreq: std::sync::atomic::AtomicBool::new(false),
            allow_redirects: std::sync::atomic::AtomicBool::new(allow_redirects),
            cancel: CancellationToken::new(),
            parent: parent.clone(),
            children: Mutex::new(Vec::new()),
            hooks,
            state_hook: Mutex::new(state_hook),
            opaque: Mutex::new(opaque),
            builder: Mutex::new(builder),
            peer: Mutex::new(peer),
        });
        lock(&self.outstanding).insert(id, inner.clone());
        if let Some(parent) = &parent {
            lock(&parent.children).push(inner.clone());
        }
        tokio::spawn(drive(self.clone(), inner.clone(), target));
        inner
    }

    /// Create a child request following a redirection. The child reuses the
    /// parent's hooks and request builder; the caller keeps seeing only the
    /// original handle.
    fn create_child(self: &Arc<Self>, parent: &Arc<RequestInner>, url: &str) -> Result<(), ErrorKind> {
        let parsed = parse_url(url).map_err(|_| ErrorKind::BadUrl)?;
        let spec = CreateSpec {
            verb: parent.verb,
            url: url.to_string(),
            host: parsed.host.to_string(),
            port: parsed.port,
            path: parsed.path.to_string(),
            target: ConnectTarget::Name(parsed.host.to_string(), parsed.port),
            peer: None,
        };
        let builder = lock(&parent.builder).clone();
        let allow = parent.allow_redirects.load(Ordering::SeqCst);
        self.create(
            spec,
            parent.hooks.clone(),
            None,
            allow,
            None,
            builder,
            Some(parent.clone()),
        );
        Ok(())
    }

    /// Terminate a request with an error: the error hook fires exactly once
    /// on the root of the redirect chain, then the whole tree is logically
    /// freed.
    pub(crate) fn fail(&self, req: &Arc<RequestInner>, err: HttpClientError) {
        let root = req.root();
        if root.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = lock(&root.hooks).on_error.take();
        if let Some(f) = hook {
            f(&err);
        }
        log_error(&root.info(), &err);
        self.free_tree(&root);
    }

    /// Terminate a request silently (close, take-over, end of stream).
    pub(crate) fn release(&self, req: &Arc<RequestInner>) {
        let root = req.root();
        if root.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.free_tree(&root);
    }

    /// Logical free of a request tree: callbacks are muted, tasks unwound,
    /// ids queued for physical removal on the next sweep.
    fn free_tree(&self, node: &Arc<RequestInner>) {
        node.freed.store(true, Ordering::SeqCst);
        node.cancel.cancel();
        *lock(&node.state) = RequestState::Removed;
        lock(&node.opaque).take();
        lock(&self.pending_free).push(node.id);
        let children: Vec<_> = lock(&node.children).clone();
        for child in &children {
            self.free_tree(child);
        }
    }

    /// Expire stalled requests and reclaim the logically freed ones.
    fn sweep(&self, now: Instant) {
        let snapshot: Vec<Arc<RequestInner>> = lock(&self.outstanding).values().cloned().collect();
        for req in snapshot {
            if req.freed.load(Ordering::SeqCst) || req.subreq.load(Ordering::SeqCst) {
                continue;
            }
            let state = *lock(&req.state);
            let (deadline, kind) = match state {
                RequestState::Unknown | RequestState::Connecting => {
                    (self.cfg.connect_timeout(), ErrorKind::ConnTimeout)
                }
                RequestState::Removed => continue,
                _ => (self.cfg.exchange_timeout(), ErrorKind::Timeout),
            };
            let last = *lock(&req.last_activity);
            if now.duration_since(last) > deadline {
                self.fail(&req, HttpClientError::Error(kind));
            }
        }

        let ids: Vec<u64> = std::mem::take(&mut *lock(&self.pending_free));
        if !ids.is_empty() {
            let mut outstanding = lock(&self.outstanding);
            for id in ids {
                outstanding.remove(&id);
            }
        }
    }
}

/// Log a request failure the way the engine does, gated by verbosity:
/// cancellation and graceful close stay below debug level.
pub fn log_error(info: &RequestInfo, err: &HttpClientError) {
    match err {
        HttpClientError::Sys(e) => debug!("aborting \"{info}\" on system error: {e}"),
        HttpClientError::Error(ErrorKind::Cancelled) => trace!("explicitly cancelled \"{info}\""),
        HttpClientError::Error(ErrorKind::Closed) => trace!("connection closed for \"{info}\""),
        HttpClientError::Error(kind) => debug!("aborting \"{info}\" on error: {kind}"),
        HttpClientError::Header(e) => debug!("aborting \"{info}\" on header parsing error: {e}"),
        HttpClientError::Http { code, message, .. } => {
            debug!("stopping \"{info}\": HTTP {code} {message}");
        }
    }
}

async fn drive(engine: Arc<EngineShared>, req: Arc<RequestInner>, target: ConnectTarget) {
    if let Err(err) = run(&engine, &req, target).await {
        engine.fail(&req, err);
    }
}

/// Resolve a future against the request's cancellation token; `None` means
/// the request was freed under us and the task must unwind quietly.
async fn checked<T>(req: &RequestInner, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = req.cancel.cancelled() => None,
        v = fut => Some(v),
    }
}

async fn run(
    engine: &Arc<EngineShared>,
    req: &Arc<RequestInner>,
    target: ConnectTarget,
) -> Result<(), HttpClientError> {
    let sched = engine.sched.as_ref();

    // State is Connecting from creation on.
    let connect = async {
        match &target {
            ConnectTarget::Addr(addr) => TcpStream::connect(*addr).await,
            ConnectTarget::Name(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };
    let Some(connected) = checked(req, connect).await else {
        return Ok(());
    };
    let mut stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            debug!("connection to {}:{} failed: {e}", req.host, req.port);
            return Err(HttpClientError::Error(ErrorKind::ConnFailed));
        }
    };
    if let Ok(peer) = stream.peer_addr() {
        *lock(&req.peer) = Some(peer);
    }
    req.touch();

    // Build and send the request head. A short write leaves the unsent tail
    // in a delayed buffer, drained as outbound quota comes back.
    let builder = lock(&req.builder).clone();
    let head = match builder {
        Some(f) => f(req.verb, &req.path, &req.host, req.port, &engine.cfg.user_agent),
        None => format_request(req.verb, &req.path, &req.host, req.port, &engine.cfg.user_agent),
    };
    if head.len() >= MAX_REQUEST_SIZE {
        return Err(HttpClientError::Error(ErrorKind::Req2Big));
    }

    req.set_state(RequestState::ReqSending);
    let head = head.as_bytes();
    let Some(first) = checked(req, limited_write(&mut stream, sched, head)).await else {
        return Ok(());
    };
    let sent = first.map_err(HttpClientError::Sys)?;
    if sent < head.len() {
        debug!(
            "partial HTTP request write to {}:{}: only {sent} of {} bytes sent",
            req.host,
            req.port,
            head.len()
        );
        let mut delayed = BytesMut::from(&head[sent..]);
        while !delayed.is_empty() {
            let Some(wrote) = checked(req, limited_write(&mut stream, sched, &delayed)).await
            else {
                return Ok(());
            };
            let n = wrote.map_err(HttpClientError::Sys)?;
            delayed.advance(n);
            req.touch();
        }
        trace!("flushed partially written HTTP request to {}:{}", req.host, req.port);
    }
    req.set_state(RequestState::ReqSent);

    // Read back the status line and headers.
    let collect = header_reader::collect(&mut stream, sched, engine.cfg.max_header_bytes, || {
        req.set_state(RequestState::Headers);
    });
    let Some(collected) = checked(req, collect).await else {
        return Ok(());
    };
    let collected = collected.map_err(|e| match e {
        HeaderReadError::TooBig => HttpClientError::Error(ErrorKind::Head2Big),
        HeaderReadError::Parse(p) => HttpClientError::Header(p),
        HeaderReadError::Exception => HttpClientError::Error(ErrorKind::IoError),
        HeaderReadError::Read(ioe) => HttpClientError::Sys(ioe),
        HeaderReadError::Eof => HttpClientError::Error(ErrorKind::Eof),
    })?;
    req.touch();

    let Some(status) = parse_status(&collected.status_line, Some("HTTP")) else {
        return Err(HttpClientError::Error(ErrorKind::BadStatus));
    };
    let code = status.code;
    let message = status.message.to_string();
    let headers = collected.headers;

    // A redirection we are allowed to follow is resolved before the header
    // hook fires: the caller only ever sees the headers of the final hop.
    let is_redirect = matches!(code, 301 | 302 | 303 | 307);
    // On 302 we can only blindly replay GET and HEAD.
    let verb_ok = code != 302 || matches!(req.verb, Verb::Get | Verb::Head);
    if is_redirect && req.allow_redirects.load(Ordering::SeqCst) && verb_ok {
        match redirect_target(req, &headers) {
            Ok(location) => {
                debug!(
                    "HTTP {} redirect {code} ({message}): \"{}\" -> \"{location}\"",
                    req.verb, req.url
                );
                // Release the socket before the child takes over.
                drop(stream);
                req.set_state(RequestState::Redirected);
                engine
                    .create_child(req, &location)
                    .map_err(HttpClientError::Error)?;
                req.subreq.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(kind) => {
                if fire_headers(req, &headers, code, &message) != Some(HeaderVerdict::Continue) {
                    engine.release(req);
                    return Ok(());
                }
                return Err(HttpClientError::Error(kind));
            }
        }
    }

    match fire_headers(req, &headers, code, &message) {
        Some(HeaderVerdict::Continue) => {}
        None | Some(HeaderVerdict::TakeOver) => {
            engine.release(req);
            return Ok(());
        }
    }

    match code {
        200 => {}
        301 | 302 | 303 | 307 if !req.allow_redirects.load(Ordering::SeqCst) => {
            return Err(HttpClientError::Error(ErrorKind::Redirected));
        }
        _ => {
            return Err(HttpClientError::Http {
                code,
                message,
                headers,
            });
        }
    }

    // Without a data hook we are done; the connection is dropped.
    if lock(&req.hooks).on_data.is_none() {
        return Err(HttpClientError::Error(ErrorKind::Closed));
    }

    req.set_state(RequestState::Receiving);

    // Body bytes that rode in with the header block come first.
    if !collected.leftover.is_empty() {
        match deliver_body(req, &collected.leftover) {
            BodyFlow::Continue => {}
            BodyFlow::Stop => {
                engine.release(req);
                return Ok(());
            }
            BodyFlow::Cancel => return Err(HttpClientError::Error(ErrorKind::Cancelled)),
        }
    }

    let mut buf = vec![0u8; BODY_BUFFER_SIZE];
    loop {
        let Some(read) = checked(req, limited_read(&mut stream, sched, &mut buf)).await else {
            return Ok(());
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if connection_dropped(&e) => {
                return Err(HttpClientError::Error(ErrorKind::IoError));
            }
            Err(e) => return Err(HttpClientError::Sys(e)),
        };
        if n == 0 {
            // End of stream: one final empty delivery, then the request is
            // released.
            return match deliver_body(req, &[]) {
                BodyFlow::Cancel => Err(HttpClientError::Error(ErrorKind::Cancelled)),
                BodyFlow::Continue | BodyFlow::Stop => {
                    engine.release(req);
                    Ok(())
                }
            };
        }
        match deliver_body(req, &buf[..n]) {
            BodyFlow::Continue => {}
            BodyFlow::Stop => {
                engine.release(req);
                return Ok(());
            }
            BodyFlow::Cancel => return Err(HttpClientError::Error(ErrorKind::Cancelled)),
        }
    }
}

fn redirect_target(req: &RequestInner, headers: &HeaderMap) -> Result<String, ErrorKind> {
    let Some(value) = headers.get(http::header::LOCATION) else {
        return Err(ErrorKind::NoLocation);
    };
    // The Location must be an absolute http URI.
    let Ok(url) = value.to_str() else {
        return Err(ErrorKind::BadLocationUri);
    };
    if parse_url(url).is_err() {
        return Err(ErrorKind::BadLocationUri);
    }
    // Only one level of redirection is followed.
    if req.parent.is_some() {
        return Err(ErrorKind::Nested);
    }
    Ok(url.to_string())
}

/// Invoke the header hook. `None` means the request was freed (by the hook's
/// verdict elsewhere or by a concurrent cancel) and must not be touched.
fn fire_headers(
    req: &Arc<RequestInner>,
    headers: &HeaderMap,
    code: u16,
    message: &str,
) -> Option<HeaderVerdict> {
    if req.freed.load(Ordering::SeqCst) {
        return None;
    }
    let hook = lock(&req.hooks).on_headers.take();
    let Some(mut f) = hook else {
        return Some(HeaderVerdict::Continue);
    };
    let verdict = f(headers, code, message);
    lock(&req.hooks).on_headers = Some(f);
    if req.freed.load(Ordering::SeqCst) {
        return None;
    }
    Some(verdict)
}

enum BodyFlow {
    Continue,
    Stop,
    Cancel,
}

fn deliver_body(req: &Arc<RequestInner>, data: &[u8]) -> BodyFlow {
    if req.freed.load(Ordering::SeqCst) {
        return BodyFlow::Stop;
    }
    let hook = lock(&req.hooks).on_data.take();
    let Some(mut f) = hook else {
        return BodyFlow::Stop;
    };
    let verdict = f(data);
    lock(&req.hooks).on_data = Some(f);
    if req.freed.load(Ordering::SeqCst) {
        return BodyFlow::Stop;
    }
    req.touch();
    match verdict {
        Verdict::Continue => BodyFlow::Continue,
        Verdict::Cancel => BodyFlow::Cancel,
        Verdict::Close => BodyFlow::Stop,
    }
}

fn connection_dropped(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
