#![forbid(unsafe_code)]

pub mod bandwidth;
pub mod client;
pub mod config;
pub mod http;
pub mod muid;
pub mod range;

pub use bandwidth::{BandwidthScheduler, Direction, TokenBucket, Unmetered};
pub use client::{
    log_error, ErrorKind, HeaderParseError, HeaderVerdict, HttpClientError, HttpEngine,
    RequestEvents, RequestHandle, RequestInfo, RequestOptions, RequestState, Verdict,
};
pub use config::EngineConfig;
pub use http::url::{parse_url, ParsedUrl, UrlError};
pub use http::Verb;
pub use muid::{Muid, VersionMark};
pub use range::{ByteRange, RangeSet};

/// Poison-tolerant mutex lock, used everywhere the engine guards its state.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
