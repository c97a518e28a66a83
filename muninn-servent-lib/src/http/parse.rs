//! Status-line and protocol-version parsing.

/// A parsed response status line.
///
/// `major`/`minor` are zero when the line carried no protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedStatus<'a> {
    pub code: u16,
    pub message: &'a str,
    pub major: u32,
    pub minor: u32,
}

/// Parse a protocol status line.
///
/// Recognised forms:
///
/// - `403 message` (no protocol, major/minor 0)
/// - `TAG 403 message` (protocol without version)
/// - `TAG/2.3 403 message`
///
/// When `proto` is given the leading tag must equal it exactly and be
/// followed by a space or `/`. The status code is at most three digits.
/// Gnutella handshake status lines follow the same pattern, so this routine
/// parses those too.
pub fn parse_status<'a>(line: &'a str, proto: Option<&str>) -> Option<ParsedStatus<'a>> {
    let trimmed = line.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let first = trimmed.chars().next()?;

    if first.is_ascii_digit() {
        let (code, message) = parse_code_message(trimmed)?;
        return Some(ParsedStatus { code, message, major: 0, minor: 0 });
    }

    let rest = if let Some(proto) = proto {
        let rest = line.strip_prefix(proto)?;
        let c = rest.chars().next()?;
        if !c.is_ascii_whitespace() && c != '/' {
            return None;
        }
        rest
    } else {
        let idx = trimmed.find(|c: char| c == '/' || c.is_ascii_whitespace())?;
        &trimmed[idx..]
    };

    let (major, minor, after) = if let Some(version) = rest.strip_prefix('/') {
        let (major, minor, remainder) = parse_major_minor(version)?;
        let sp = remainder.find(|c: char| c.is_ascii_whitespace())?;
        (major, minor, &remainder[sp..])
    } else {
        (0, 0, rest)
    };

    let after = after.trim_start_matches(|c: char| c.is_ascii_whitespace());
    if !after.chars().next()?.is_ascii_digit() {
        return None;
    }
    let (code, message) = parse_code_message(after)?;
    Some(ParsedStatus { code, message, major, minor })
}

/// Extract the trailing `HTTP/x.y` version of a request line.
///
/// Scans backwards for the last space, at most as far as the shortest
/// possible request (`X / HTTP/1.0`) allows. Characters after the version
/// are ignored.
pub fn extract_request_version(request: &str) -> Option<(u32, u32)> {
    const LIMIT: usize = "X / HTTP/1.0".len();
    let bytes = request.as_bytes();
    if bytes.len() < LIMIT {
        return None;
    }

    let mut space = None;
    for i in 0..LIMIT {
        if bytes[bytes.len() - 1 - i] == b' ' {
            space = Some(bytes.len() - 1 - i);
            break;
        }
    }
    let tail = &request[space? + 1..];
    let version = tail.strip_prefix("HTTP/")?;
    let (major, minor, _) = parse_major_minor(version)?;
    Some((major, minor))
}

/// Leading digits, then an optional message separated by whitespace.
fn parse_code_message(s: &str) -> Option<(u16, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let code: u32 = s[..end].parse().ok()?;
    if code > 999 {
        return None;
    }
    let rest = &s[end..];
    if let Some(c) = rest.chars().next() {
        if !c.is_ascii_whitespace() {
            return None;
        }
    }
    let message = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    Some((code as u16, message))
}

/// `major '.' minor`, returning whatever trails the minor number.
fn parse_major_minor(s: &str) -> Option<(u32, u32, &str)> {
    let d1 = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if d1 == 0 {
        return None;
    }
    let major = s[..d1].parse().ok()?;
    let rest = s[d1..].strip_prefix('.')?;
    let d2 = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if d2 == 0 {
        return None;
    }
    let minor = rest[..d2].parse().ok()?;
    Some((major, minor, &rest[d2..]))
}
