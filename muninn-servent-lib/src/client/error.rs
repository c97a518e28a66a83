//! Typed failures of the asynchronous HTTP engine.

use std::io;

use http::HeaderMap;
use thiserror::Error;

/// What terminated a request.
///
/// Setup failures are returned to the caller directly; asynchronous failures
/// reach the request's error hook exactly once, after which no further
/// callback of any kind is delivered.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// Failure surfaced from an OS-level operation.
    #[error("{0}")]
    Sys(io::Error),
    /// The server answered with a parseable non-success status.
    #[error("HTTP {code} {message}")]
    Http {
        code: u16,
        message: String,
        headers: HeaderMap,
    },
    /// The reply header block could not be parsed.
    #[error("{0}")]
    Header(HeaderParseError),
    /// Engine-internal condition.
    #[error("{0}")]
    Error(ErrorKind),
}

impl HttpClientError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// Engine-internal error conditions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Invalid HTTP URL")]
    BadUrl,
    #[error("Connection failed")]
    ConnFailed,
    #[error("I/O error")]
    IoError,
    #[error("Request too large")]
    Req2Big,
    #[error("Header too large")]
    Head2Big,
    #[error("User cancel")]
    Cancelled,
    #[error("Got EOF")]
    Eof,
    #[error("Unparseable HTTP status")]
    BadStatus,
    #[error("Got moved status, but no location")]
    NoLocation,
    #[error("Connection timeout")]
    ConnTimeout,
    #[error("Data timeout")]
    Timeout,
    #[error("Nested redirection")]
    Nested,
    #[error("Invalid URI in Location header")]
    BadLocationUri,
    #[error("Connection was closed, all OK")]
    Closed,
    #[error("Redirected, following disabled")]
    Redirected,
}

/// Why a reply header block failed to parse.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("continuation line before any header")]
    OrphanContinuation,
    #[error("header line has no colon")]
    MissingColon,
    #[error("invalid header field name")]
    BadName,
    #[error("invalid header field value")]
    BadValue,
}
