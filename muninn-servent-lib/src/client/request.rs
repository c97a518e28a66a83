//! Request-side types: states, caller hooks, and the public handle.

use std::any::Any;
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use super::error::HttpClientError;
use super::{lock, EngineShared};
use crate::http::{Verb, HTTP_PORT};

/// Lifecycle of an asynchronous HTTP request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Unknown,
    Connecting,
    ReqSending,
    ReqSent,
    Headers,
    Receiving,
    /// The request spawned a child to follow a redirection; the child now
    /// has control.
    Redirected,
    /// Logically freed; no further notification is delivered.
    Removed,
}

/// What a data hook wants the engine to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Stop with an error: the hook observes `Cancelled` through the error
    /// hook, then the request is released.
    Cancel,
    /// Stop silently; the request is released with no error.
    Close,
}

/// What a header hook wants the engine to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderVerdict {
    Continue,
    /// The caller has taken over: processing stops with no error and no
    /// further callbacks.
    TakeOver,
}

pub type HeaderHook = Box<dyn FnMut(&HeaderMap, u16, &str) -> HeaderVerdict + Send>;
pub type DataHook = Box<dyn FnMut(&[u8]) -> Verdict + Send>;
pub type ErrorHook = Box<dyn FnOnce(&HttpClientError) + Send>;
pub type StateHook = Box<dyn FnMut(RequestState) + Send>;

/// Builds the outgoing request head from `(verb, path, host, port, agent)`.
pub type RequestBuilder = dyn Fn(Verb, &str, &str, u16, &str) -> String + Send + Sync;

/// Caller-supplied hooks for one request.
///
/// `on_headers` fires at most once, before any data; `on_data` receives the
/// body in arrival order and an empty slice at end of stream. Without an
/// `on_data` hook the connection is closed once the headers are in. The
/// error hook fires at most once and precludes any further delivery.
pub struct RequestEvents {
    pub(crate) on_headers: Option<HeaderHook>,
    pub(crate) on_data: Option<DataHook>,
    pub(crate) on_error: ErrorHook,
    pub(crate) on_state: Option<StateHook>,
}

impl RequestEvents {
    pub fn new<F>(on_error: F) -> Self
    where
        F: FnOnce(&HttpClientError) + Send + 'static,
    {
        Self {
            on_headers: None,
            on_data: None,
            on_error: Box::new(on_error),
            on_state: None,
        }
    }

    pub fn on_headers<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HeaderMap, u16, &str) -> HeaderVerdict + Send + 'static,
    {
        self.on_headers = Some(Box::new(f));
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8]) -> Verdict + Send + 'static,
    {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_state<F>(mut self, f: F) -> Self
    where
        F: FnMut(RequestState) + Send + 'static,
    {
        self.on_state = Some(Box::new(f));
        self
    }

    pub(crate) fn into_parts(self) -> (Arc<Mutex<Hooks>>, Option<StateHook>) {
        let hooks = Hooks {
            on_headers: self.on_headers,
            on_data: self.on_data,
            on_error: Some(self.on_error),
        };
        (Arc::new(Mutex::new(hooks)), self.on_state)
    }
}

/// Hook set shared by a request and any child spawned to follow redirects,
/// so the redirect chain stays invisible to the caller.
pub(crate) struct Hooks {
    pub(crate) on_headers: Option<HeaderHook>,
    pub(crate) on_data: Option<DataHook>,
    pub(crate) on_error: Option<ErrorHook>,
}

/// Options applied at request creation.
#[derive(Default)]
pub struct RequestOptions {
    /// Follow 3xx replies (off by default).
    pub allow_redirects: bool,
    /// Caller context retrievable from the handle; dropped when the request
    /// is freed.
    pub opaque: Option<Box<dyn Any + Send>>,
    /// Overrides the formatting of the outgoing request head.
    pub request_builder: Option<Arc<RequestBuilder>>,
}

pub(crate) struct RequestInner {
    pub(crate) id: u64,
    pub(crate) verb: Verb,
    pub(crate) url: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
    pub(crate) state: Mutex<RequestState>,
    pub(crate) last_activity: Mutex<Instant>,
    /// Logical-free flag; once set, the request memory is off limits to
    /// every delivery path.
    pub(crate) freed: AtomicBool,
    /// A child request now has control.
    pub(crate) subreq: AtomicBool,
    pub(crate) allow_redirects: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) parent: Option<Arc<RequestInner>>,
    pub(crate) children: Mutex<Vec<Arc<RequestInner>>>,
    pub(crate) hooks: Arc<Mutex<Hooks>>,
    pub(crate) state_hook: Mutex<Option<StateHook>>,
    pub(crate) opaque: Mutex<Option<Box<dyn Any + Send>>>,
    pub(crate) builder: Mutex<Option<Arc<RequestBuilder>>>,
    pub(crate) peer: Mutex<Option<SocketAddr>>,
}

impl RequestInner {
    pub(crate) fn root(self: &Arc<Self>) -> Arc<RequestInner> {
        let mut current = self.clone();
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Change state and notify the listener, if any. Freed requests are
    /// mute.
    pub(crate) fn set_state(&self, state: RequestState) {
        if self.freed.load(Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = state;
        self.touch();
        let hook = lock(&self.state_hook).take();
        if let Some(mut f) = hook {
            f(state);
            lock(&self.state_hook).get_or_insert(f);
        }
    }

    pub(crate) fn info(&self) -> RequestInfo {
        RequestInfo {
            verb: self.verb,
            url: self.url.clone(),
            peer: *lock(&self.peer),
        }
    }
}

/// Request parameters for caller-side logging.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub verb: Verb,
    pub url: String,
    pub peer: Option<SocketAddr>,
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.url)?;
        match self.peer {
            Some(peer) => write!(f, " @ {peer}"),
            None => write!(f, " @ unresolved"),
        }
    }
}

/// Caller-side handle on an in-flight request.
///
/// The handle stays valid across redirections: state queries resolve through
/// the child that currently has control.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) inner: Arc<RequestInner>,
    pub(crate) engine: Arc<EngineShared>,
}

impl RequestHandle {
    /// Current request state; for a redirected request, the state of the
    /// first active child.
    pub fn state(&self) -> RequestState {
        let state = *lock(&self.inner.state);
        if state != RequestState::Redirected {
            return state;
        }
        let children = lock(&self.inner.children);
        for child in children.iter() {
            let child_state = *lock(&child.state);
            if child_state != RequestState::Redirected && child_state != RequestState::Removed {
                return child_state;
            }
        }
        RequestState::Unknown
    }

    /// Abort the request: the error hook observes `Cancelled`, then the
    /// request is logically freed. Idempotent.
    pub fn cancel(&self) {
        self.engine.fail(
            &self.inner,
            HttpClientError::Error(super::ErrorKind::Cancelled),
        );
    }

    /// Release the request silently: no error is reported. Idempotent.
    pub fn close(&self) {
        self.engine.release(&self.inner);
    }

    pub fn verb(&self) -> Verb {
        self.inner.verb
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn info(&self) -> RequestInfo {
        self.inner.info()
    }

    /// Whether 3xx replies are followed transparently.
    pub fn allow_redirects(&self, allow: bool) {
        self.inner.allow_redirects.store(allow, Ordering::SeqCst);
    }

    /// Register a state-change listener.
    pub fn on_state_change<F>(&self, f: F)
    where
        F: FnMut(RequestState) + Send + 'static,
    {
        *lock(&self.inner.state_hook) = Some(Box::new(f));
    }

    /// Redefine how the outgoing request head is formatted. Takes effect if
    /// installed before the connection is established.
    pub fn set_request_builder<F>(&self, f: F)
    where
        F: Fn(Verb, &str, &str, u16, &str) -> String + Send + Sync + 'static,
    {
        *lock(&self.inner.builder) = Some(Arc::new(f));
    }

    /// Attach caller context to the request; dropped when the request is
    /// freed.
    pub fn set_opaque(&self, data: Box<dyn Any + Send>) {
        *lock(&self.inner.opaque) = Some(data);
    }

    pub fn take_opaque(&self) -> Option<Box<dyn Any + Send>> {
        lock(&self.inner.opaque).take()
    }
}

/// Default request head: the port is omitted when it is the plain HTTP one.
pub(crate) fn format_request(verb: Verb, path: &str, host: &str, port: u16, agent: &str) -> String {
    let mut head = String::with_capacity(128);
    let _ = write!(head, "{verb} {path} HTTP/1.1\r\nHost: ");
    if host.contains(':') {
        let _ = write!(head, "[{host}]");
    } else {
        head.push_str(host);
    }
    if port != HTTP_PORT {
        let _ = write!(head, ":{port}");
    }
    let _ = write!(head, "\r\nUser-Agent: {agent}\r\nConnection: close\r\n\r\n");
    head
}
