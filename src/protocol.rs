//! HTTP/1.1 request parsing and URL classification.
//!
//! One request per pop: the parser sees a single contiguous buffer and
//! reports whether a full request is present. Reassembly of partial
//! requests is deliberately unsupported.

/// Result of attempting to parse a request from a byte buffer.
#[derive(Debug)]
pub enum ParseResult {
    /// A full request is present.
    Complete(Request),
    /// Need more data.
    Incomplete,
    /// Malformed request; the bytes can never become a valid request.
    Error,
}

#[derive(Debug)]
pub struct Request {
    pub url: String,
}

/// What a URL asks the server to do, and the routing tag for the
/// by-type policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    File,
    Regex,
}

impl RequestKind {
    pub fn tag(self) -> usize {
        match self {
            RequestKind::File => 0,
            RequestKind::Regex => 1,
        }
    }
}

const METHODS: [&[u8]; 9] = [
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"OPTIONS", b"TRACE", b"PATCH", b"CONNECT",
];
const MAX_METHOD_LEN: usize = 7;

/// Try to parse one request from `buf`.
pub fn parse(buf: &[u8]) -> ParseResult {
    if buf.is_empty() {
        return ParseResult::Incomplete;
    }

    // Fail garbage fast: a first token that is no HTTP method can never
    // become a request line, with or without more bytes.
    match buf.iter().position(|&b| b == b' ') {
        Some(sp) => {
            if !METHODS.contains(&&buf[..sp]) {
                return ParseResult::Error;
            }
        }
        None => {
            if buf.len() > MAX_METHOD_LEN || !METHODS.iter().any(|m| m.starts_with(buf)) {
                return ParseResult::Error;
            }
            return ParseResult::Incomplete;
        }
    }

    let Some(line_end) = find(buf, b"\r\n") else {
        return ParseResult::Incomplete;
    };
    let Ok(line) = std::str::from_utf8(&buf[..line_end]) else {
        return ParseResult::Error;
    };
    let parts: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return ParseResult::Error;
    }
    let url = parts[1];

    let Some(head_end) = find(buf, b"\r\n\r\n") else {
        return ParseResult::Incomplete;
    };
    let Ok(head) = std::str::from_utf8(&buf[..head_end]) else {
        return ParseResult::Error;
    };
    if let Some(len) = content_length(head) {
        if buf.len() < head_end + 4 + len {
            return ParseResult::Incomplete;
        }
    }

    ParseResult::Complete(Request {
        url: url.to_string(),
    })
}

/// Classify a parsed URL.
pub fn classify(url: &str) -> RequestKind {
    let path = url.split_once('?').map_or(url, |(p, _)| p);
    if path == "/regex" || path.starts_with("/regex/") {
        RequestKind::Regex
    } else {
        RequestKind::File
    }
}

/// Request-line-only peek for routing: pulls the URL token out of raw bytes
/// without a full parse. Anything unreadable routes as a file request.
pub fn classify_raw(buf: &[u8]) -> RequestKind {
    let line_end = buf
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(buf.len());
    let mut parts = buf[..line_end].split(|&b| b == b' ').filter(|t| !t.is_empty());
    let _method = parts.next();
    match parts.next().and_then(|u| std::str::from_utf8(u).ok()) {
        Some(url) => classify(url),
        None => RequestKind::File,
    }
}

fn find(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}

fn content_length(head: &str) -> Option<usize> {
    for line in head.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_of(result: ParseResult) -> String {
        match result {
            ParseResult::Complete(req) => req.url,
            other => panic!("expected complete request, got {other:?}"),
        }
    }

    #[test]
    fn complete_request_with_headers() {
        let r = parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(url_of(r), "/index.html");
    }

    #[test]
    fn complete_request_without_headers() {
        let r = parse(b"GET /missing HTTP/1.1\r\n\r\n");
        assert_eq!(url_of(r), "/missing");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(parse(b"NOT_HTTP garbage"), ParseResult::Error));
    }

    #[test]
    fn garbage_without_space_is_an_error() {
        assert!(matches!(parse(b"XYZZYXYZZY"), ParseResult::Error));
    }

    #[test]
    fn method_prefix_is_incomplete() {
        assert!(matches!(parse(b"GE"), ParseResult::Incomplete));
        assert!(matches!(parse(b"GET /inde"), ParseResult::Incomplete));
    }

    #[test]
    fn missing_terminator_is_incomplete() {
        assert!(matches!(
            parse(b"GET /a HTTP/1.1\r\nHost: x\r\n"),
            ParseResult::Incomplete
        ));
    }

    #[test]
    fn wrong_token_count_is_an_error() {
        assert!(matches!(
            parse(b"GET /a b HTTP/1.1\r\n\r\n"),
            ParseResult::Error
        ));
    }

    #[test]
    fn non_http_version_is_an_error() {
        assert!(matches!(
            parse(b"GET /a SPDY/3\r\n\r\n"),
            ParseResult::Error
        ));
    }

    #[test]
    fn body_respects_content_length() {
        let partial = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert!(matches!(parse(partial), ParseResult::Incomplete));
        let full = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert_eq!(url_of(parse(full)), "/u");
    }

    #[test]
    fn classify_urls() {
        assert_eq!(classify("/index.html"), RequestKind::File);
        assert_eq!(classify("/regex?value=abc"), RequestKind::Regex);
        assert_eq!(classify("/regex/sub?value=a"), RequestKind::Regex);
        assert_eq!(classify("/regexes.html"), RequestKind::File);
    }

    #[test]
    fn classify_raw_peeks_the_request_line() {
        assert_eq!(
            classify_raw(b"GET /regex?value=a HTTP/1.1\r\nHost: x\r\n\r\n"),
            RequestKind::Regex
        );
        assert_eq!(
            classify_raw(b"GET /file.txt HTTP/1.1\r\n\r\n"),
            RequestKind::File
        );
        assert_eq!(classify_raw(b"junk"), RequestKind::File);
    }
}
