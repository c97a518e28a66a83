//! Outgoing HTTP response heads.
//!
//! `send_status` writes a complete HTTP/1.1 status reply through the
//! bandwidth scheduler. When the outbound link is saturated the generated
//! header shrinks: optional fields are dropped and callback extras are told
//! to keep quiet, so that only the essential bytes compete for quota.

use std::io::Write as _;
use std::time::SystemTime;

use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::bandwidth::{limited_write, BandwidthScheduler, Direction};

/// Hard cap on a generated response head, body included.
pub const STATUS_BUFFER_SIZE: usize = 2560;

/// Flags handed to callback extras while the head is being composed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplyFlags {
    /// The outbound link is at quota.
    pub saturated: bool,
    /// The reply is a 503.
    pub busy_signal: bool,
    /// Available ranges should be advertised (2xx or 416, kept alive).
    pub show_ranges: bool,
    /// Optional content must be dropped; emit nothing or the bare minimum.
    pub small_reply: bool,
}

/// One item to splice into a response head.
pub enum StatusExtra<'a> {
    /// A literal, `\r\n`-terminated header line.
    Line(&'a str),
    /// An inline response body; emitted after the head together with its
    /// `Content-Length`.
    Body(&'a str),
    /// Writes header bytes into the remaining buffer space and returns the
    /// byte count. Must write nothing when its content cannot fit.
    Callback(&'a mut dyn FnMut(&mut [u8], ReplyFlags) -> usize),
}

/// Collaborator-supplied fields of a response head.
///
/// The builder never reads the wall clock or global version state; the
/// embedding servent injects everything here, `now` in UTC.
pub struct StatusContext<'a> {
    pub now: SystemTime,
    /// `Server:` value.
    pub server: &'a str,
    /// Shorter `Server:` value used when bandwidth is tight.
    pub server_compact: Option<&'a str>,
    /// `X-Token:` value, when the connection should carry one.
    pub token: Option<&'a str>,
    /// Shorter token for saturated replies.
    pub token_compact: Option<&'a str>,
    /// `X-Live-Since:` timestamp.
    pub live_since: Option<SystemTime>,
}

/// Format a complete response head (and optional body).
///
/// The emitted size is capped depending on the response class: 1 KiB for
/// 5xx, 512 bytes for 4xx (except a kept-alive 416, which needs room for
/// the available ranges), 512 bytes for any reply at or above 300 while the
/// link is saturated. If the extras overflow the cap, the head reverts to
/// its minimal form; nothing is truncated mid-header.
pub fn format_status(
    ctx: &StatusContext<'_>,
    code: u16,
    keep_alive: bool,
    saturated: bool,
    extras: &mut [StatusExtra<'_>],
    reason: &str,
) -> Vec<u8> {
    let mut flags = ReplyFlags {
        saturated,
        busy_signal: code == 503,
        ..ReplyFlags::default()
    };

    let mut header_size = STATUS_BUFFER_SIZE;
    if (500..=599).contains(&code) {
        header_size = 1024;
    } else if (400..=499).contains(&code) {
        header_size = 512;
    }

    if keep_alive {
        if code == 416 {
            // Was reduced above for 4xx; a kept-alive 416 carries ranges.
            header_size = STATUS_BUFFER_SIZE;
            flags.show_ranges = true;
        } else if (200..=299).contains(&code) {
            flags.show_ranges = true;
        }
    }

    // If bandwidth is short, drop X-Live-Since and reduce the header size
    // noticeably, so that only the most important stuff gets out.
    let (server, token, live_since) = if saturated && code >= 300 {
        header_size = 512;
        flags.small_reply = true;
        (
            ctx.server_compact.unwrap_or(ctx.server),
            ctx.token_compact.or(ctx.token),
            None,
        )
    } else {
        (ctx.server, ctx.token, ctx.live_since)
    };

    let mut body = None;
    for extra in extras.iter() {
        if let StatusExtra::Body(b) = extra {
            if !b.is_empty() {
                body = Some(*b);
            }
            break;
        }
    }

    let no_content = code >= 300 && keep_alive && body.is_none();

    let mut buf: Vec<u8> = Vec::with_capacity(header_size);
    let _ = write!(
        buf,
        "HTTP/1.1 {code} {reason}\r\nServer: {server}\r\nDate: {}\r\n",
        httpdate::fmt_http_date(ctx.now)
    );
    if !keep_alive {
        buf.extend_from_slice(b"Connection: close\r\n");
    }
    if let Some(token) = token {
        let _ = write!(buf, "X-Token: {token}\r\n");
    }
    if let Some(since) = live_since {
        let _ = write!(buf, "X-Live-Since: {}\r\n", httpdate::fmt_http_date(since));
    }
    if no_content {
        buf.extend_from_slice(b"Content-Length: 0\r\n");
    }

    let minimal_len = buf.len();
    let has_extras = !extras.is_empty();

    for extra in extras.iter_mut() {
        // Leave room for the terminating blank line.
        if buf.len() + 3 >= header_size {
            break;
        }
        match extra {
            StatusExtra::Body(_) => {}
            StatusExtra::Line(line) => buf.extend_from_slice(line.as_bytes()),
            StatusExtra::Callback(cb) => {
                let avail = header_size - buf.len();
                let start = buf.len();
                buf.resize(start + avail, 0);
                let written = cb(&mut buf[start..], flags).min(avail);
                buf.truncate(start + written);
            }
        }
    }

    if let Some(body) = body {
        let _ = write!(buf, "Content-Length: {}\r\n", body.len());
    }
    if buf.len() < header_size {
        buf.extend_from_slice(b"\r\n");
    }
    if let Some(body) = body {
        buf.extend_from_slice(body.as_bytes());
    }

    if buf.len() > header_size && has_extras {
        warn!("HTTP status {code} ({reason}) too big, dropping extra information");
        buf.truncate(minimal_len);
        buf.extend_from_slice(b"\r\n");
    }

    buf
}

/// Send an HTTP status reply on `stream`, with code and reason.
///
/// The connection is not closed; at the HTTP level it ends unless
/// `keep_alive` is set. Returns `true` only if the whole sequence left the
/// write side.
pub async fn send_status<S>(
    stream: &mut S,
    sched: &dyn BandwidthScheduler,
    ctx: &StatusContext<'_>,
    code: u16,
    keep_alive: bool,
    extras: &mut [StatusExtra<'_>],
    reason: &str,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    let saturated = sched.saturated(Direction::Outbound);
    let bytes = format_status(ctx, code, keep_alive, saturated, extras, reason);

    let mut off = 0;
    while off < bytes.len() {
        match limited_write(stream, sched, &bytes[off..]).await {
            Ok(0) => {
                debug!("write side gone while sending HTTP status {code} ({reason})");
                return false;
            }
            Ok(n) => off += n,
            Err(e) => {
                debug!("unable to send back HTTP status {code} ({reason}): {e}");
                return false;
            }
        }
    }
    true
}

/// Status callback adding an `X-Hostname:` line bearing the fully qualified
/// hostname. Emits nothing under `small_reply`.
pub fn hostname_extra(hostname: &str) -> impl FnMut(&mut [u8], ReplyFlags) -> usize + '_ {
    move |buf, flags| {
        if flags.small_reply {
            return 0;
        }
        let line = format!("X-Hostname: {hostname}\r\n");
        if line.len() > buf.len() {
            return 0;
        }
        buf[..line.len()].copy_from_slice(line.as_bytes());
        line.len()
    }
}
