//! Incremental collection of a reply header block.
//!
//! Bytes are read off the socket until a blank-line-terminated block is in;
//! the block is then split into the verbatim status line and a parsed header
//! map. Whatever followed the blank line is handed back untouched so the
//! body path can replay it.

use std::io;

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::AsyncRead;

use super::error::HeaderParseError;
use crate::bandwidth::{limited_read, BandwidthScheduler};

const READ_CHUNK: usize = 512;

pub(crate) struct CollectedHeader {
    /// First line of the block, verbatim.
    pub(crate) status_line: String,
    pub(crate) headers: HeaderMap,
    /// Body bytes that arrived together with the header block.
    pub(crate) leftover: Vec<u8>,
}

pub(crate) enum HeaderReadError {
    /// The block outgrew the configured cap.
    TooBig,
    Parse(HeaderParseError),
    /// The peer dropped the connection mid-block.
    Exception,
    /// Read failure, errno preserved.
    Read(io::Error),
    /// Clean end of stream before the block completed.
    Eof,
}

/// Collect one header block. `on_start` fires when the first bytes arrive.
pub(crate) async fn collect<S>(
    stream: &mut S,
    sched: &dyn BandwidthScheduler,
    max: usize,
    mut on_start: impl FnMut(),
) -> Result<CollectedHeader, HeaderReadError>
where
    S: AsyncRead + Unpin,
{
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut started = false;

    loop {
        let n = limited_read(stream, sched, &mut chunk)
            .await
            .map_err(classify)?;
        if n == 0 {
            return Err(HeaderReadError::Eof);
        }
        if !started {
            started = true;
            on_start();
        }
        acc.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_blank_line(&acc) {
            if pos > max {
                return Err(HeaderReadError::TooBig);
            }
            let leftover = acc[pos..].to_vec();
            let (status_line, headers) =
                parse_block(&acc[..pos]).map_err(HeaderReadError::Parse)?;
            return Ok(CollectedHeader {
                status_line,
                headers,
                leftover,
            });
        }
        if acc.len() > max {
            return Err(HeaderReadError::TooBig);
        }
    }
}

fn classify(e: io::Error) -> HeaderReadError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => HeaderReadError::Exception,
        _ => HeaderReadError::Read(e),
    }
}

/// Offset just past the `\r\n\r\n` terminator, if present.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .and_then(|p| p.checked_add(4))
}

/// Split a complete block (terminator included) into the status line and a
/// header map. Continuation lines fold into the previous field.
fn parse_block(block: &[u8]) -> Result<(String, HeaderMap), HeaderParseError> {
    let body = &block[..block.len().saturating_sub(4)];
    let mut lines: Vec<&[u8]> = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < body.len() {
        if body[i] == b'\r' && body[i + 1] == b'\n' {
            lines.push(&body[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    lines.push(&body[start..]);

    let status_line = String::from_utf8_lossy(lines[0]).into_owned();

    let mut fields: Vec<(HeaderName, Vec<u8>)> = Vec::new();
    for line in &lines[1..] {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            let Some(last) = fields.last_mut() else {
                return Err(HeaderParseError::OrphanContinuation);
            };
            last.1.push(b' ');
            last.1.extend_from_slice(line.trim_ascii());
        } else {
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(HeaderParseError::MissingColon)?;
            let name = HeaderName::from_bytes(line[..colon].trim_ascii())
                .map_err(|_| HeaderParseError::BadName)?;
            fields.push((name, line[colon + 1..].trim_ascii().to_vec()));
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in fields {
        let value = HeaderValue::from_bytes(&value).map_err(|_| HeaderParseError::BadValue)?;
        headers.append(name, value);
    }
    Ok((status_line, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_splits_into_status_headers_and_leftover() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: x\r\nX-Thing: a\r\nX-Thing: b\r\n\r\nBODY";
        let pos = find_blank_line(raw).unwrap();
        let (status, headers) = parse_block(&raw[..pos]).unwrap();
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(headers.get("server").unwrap(), "x");
        assert_eq!(headers.get_all("x-thing").iter().count(), 2);
        assert_eq!(&raw[pos..], b"BODY");
    }

    #[test]
    fn continuation_lines_fold() {
        let raw = b"200 OK\r\nX-Long: one\r\n two\r\n\r\n";
        let pos = find_blank_line(raw).unwrap();
        let (_, headers) = parse_block(&raw[..pos]).unwrap();
        assert_eq!(headers.get("x-long").unwrap(), "one two");
    }

    #[test]
    fn orphan_continuation_is_an_error() {
        let raw = b"200 OK\r\n folded\r\n\r\n";
        let pos = find_blank_line(raw).unwrap();
        assert_eq!(
            parse_block(&raw[..pos]).unwrap_err(),
            HeaderParseError::OrphanContinuation
        );
    }

    #[test]
    fn missing_colon_is_an_error() {
        let raw = b"200 OK\r\nbogus line\r\n\r\n";
        let pos = find_blank_line(raw).unwrap();
        assert_eq!(
            parse_block(&raw[..pos]).unwrap_err(),
            HeaderParseError::MissingColon
        );
    }
}
