use muninn_servent_lib::http::parse::{extract_request_version, parse_status};
use muninn_servent_lib::http::url::{parse_url, UrlError};

#[test]
fn bare_code_has_no_version() {
    let status = parse_status("403 Forbidden", None).unwrap();
    assert_eq!(status.code, 403);
    assert_eq!(status.message, "Forbidden");
    assert_eq!((status.major, status.minor), (0, 0));
}

#[test]
fn tag_without_version() {
    let status = parse_status("GNUTELLA 503 Busy", None).unwrap();
    assert_eq!(status.code, 503);
    assert_eq!(status.message, "Busy");
    assert_eq!((status.major, status.minor), (0, 0));
}

#[test]
fn tag_with_version() {
    let status = parse_status("HTTP/1.1 200 OK", Some("HTTP")).unwrap();
    assert_eq!(status.code, 200);
    assert_eq!(status.message, "OK");
    assert_eq!((status.major, status.minor), (1, 1));

    let status = parse_status("GNUTELLA/0.6 200 OK", Some("GNUTELLA")).unwrap();
    assert_eq!((status.major, status.minor), (0, 6));
}

#[test]
fn expected_protocol_must_match_exactly() {
    assert!(parse_status("FTP/1.0 200 ok", Some("HTTP")).is_none());
    assert!(parse_status("http/1.1 200 ok", Some("HTTP")).is_none());
    assert!(parse_status("HTTPS/1.1 200 ok", Some("HTTP")).is_none());
}

#[test]
fn malformed_status_lines_are_refused() {
    assert!(parse_status("", None).is_none());
    assert!(parse_status("   ", None).is_none());
    assert!(parse_status("HTTP", Some("HTTP")).is_none());
    assert!(parse_status("HTTP/1.1", Some("HTTP")).is_none());
    assert!(parse_status("HTTP/x.y 200 ok", Some("HTTP")).is_none());
    assert!(parse_status("1000 too big", None).is_none());
    assert!(parse_status("12a nope", None).is_none());
}

#[test]
fn message_is_optional() {
    let status = parse_status("HTTP/1.1 204", Some("HTTP")).unwrap();
    assert_eq!(status.code, 204);
    assert_eq!(status.message, "");
}

#[test]
fn every_code_round_trips() {
    for code in 0..=999u16 {
        let line = format!("HTTP/1.1 {code} some reason");
        let status = parse_status(&line, Some("HTTP")).unwrap();
        assert_eq!(status.code, code);
        assert_eq!(status.message, "some reason");
    }
}

#[test]
fn request_version_is_found_at_the_tail() {
    assert_eq!(extract_request_version("GET / HTTP/1.0"), Some((1, 0)));
    assert_eq!(
        extract_request_version("GET /a/very/long/path/elsewhere HTTP/1.1"),
        Some((1, 1))
    );
    assert_eq!(extract_request_version("X / HTTP/1.0"), Some((1, 0)));
    assert_eq!(extract_request_version("GET /path"), None);
    assert_eq!(extract_request_version("GET /"), None);
    // Trailing characters after the version are ignored.
    assert_eq!(extract_request_version("GET / HTTP/2.0junk"), Some((2, 0)));
}

#[test]
fn url_with_ipv6_literal_and_port() {
    let parsed = parse_url("http://[::1]:8080/foo").unwrap();
    assert_eq!(parsed.host, "::1");
    assert_eq!(parsed.port, 8080);
    assert_eq!(parsed.path, "/foo");
}

#[test]
fn url_port_defaults_to_80() {
    let parsed = parse_url("http://x/").unwrap();
    assert_eq!(parsed.host, "x");
    assert_eq!(parsed.port, 80);
    assert_eq!(parsed.path, "/");
}

#[test]
fn url_scheme_must_be_http() {
    assert_eq!(parse_url("ftp://x/"), Err(UrlError::NotHttp));
    assert_eq!(parse_url("x/"), Err(UrlError::NotHttp));
}

#[test]
fn url_port_errors_are_distinguished() {
    assert_eq!(parse_url("http://x:abc/"), Err(UrlError::BadPortParsing));
    assert_eq!(parse_url("http://x:99999/"), Err(UrlError::BadPortRange));
    assert_eq!(parse_url("http://x:0/"), Err(UrlError::BadPortRange));
    assert!(parse_url("http://x:65535/").is_ok());
}

#[test]
fn url_needs_a_path() {
    assert_eq!(parse_url("http://x"), Err(UrlError::MissingUri));
    assert_eq!(parse_url("http://x:8080"), Err(UrlError::MissingUri));
}

#[test]
fn url_host_must_be_sane() {
    assert_eq!(parse_url("http:///path"), Err(UrlError::BadHostPart));
    assert_eq!(parse_url("http://[zzz]/"), Err(UrlError::BadHostPart));
    assert_eq!(parse_url("http://ho st/"), Err(UrlError::BadHostPart));
    let parsed = parse_url("http://peer-3.example.net:6346/uri-res/N2R").unwrap();
    assert_eq!(parsed.host, "peer-3.example.net");
    assert_eq!(parsed.port, 6346);
    assert_eq!(parsed.path, "/uri-res/N2R");
}
