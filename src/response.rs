//! Response builders: static files, regex evaluation, bad requests.
//!
//! Every builder returns one owned buffer holding the status line, headers
//! and body; ownership then travels through the datapath until the push
//! that delivers it completes.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::warn;
use regex::Regex;

use crate::config::MAX_REGEX_HTML;
use crate::protocol::{self, RequestKind};

/// Fixed response for malformed requests. No body.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

/// Text the regex builder evaluates patterns against.
const REGEX_CORPUS: &str = "the quick brown fox jumps over the lazy dog \
                            pack my box with five dozen liquor jugs \
                            how vexingly quick daft zebras jump \
                            sphinx of black quartz judge my vow \
                            0123456789 qhttpd@example.com 192.168.0.1";

pub fn bad_request() -> Vec<u8> {
    BAD_REQUEST_RESPONSE.to_vec()
}

/// Dispatch a parsed URL to the matching builder.
pub fn build(url: &str, doc_root: &Path) -> Vec<u8> {
    match protocol::classify(url) {
        RequestKind::Regex => regex_response(url),
        RequestKind::File => file_response(url, doc_root),
    }
}

/// Serve a file under the document root. Missing paths and directories get
/// a 404 with an empty body.
pub fn file_response(url: &str, doc_root: &Path) -> Vec<u8> {
    let Some(path) = url_to_path(url, doc_root) else {
        warn!("rejecting traversal in requested path {url}");
        return assemble(404, "text/html", b"");
    };
    match fs::metadata(&path) {
        Err(_) => {
            warn!("failed to get status of requested file {}", path.display());
            assemble(404, "text/html", b"")
        }
        Ok(md) if md.is_dir() => {
            warn!("directory requested ({}), returning 404", path.display());
            assemble(404, "text/html", b"")
        }
        Ok(_) => match fs::read(&path) {
            Err(e) => {
                warn!("failed to access requested file {}: {e}", path.display());
                assemble(404, "text/html", b"")
            }
            Ok(body) => assemble(200, mime_type(&path), &body),
        },
    }
}

/// Evaluate the `value` query parameter as a regular expression against the
/// built-in corpus and render the matches as HTML. The body is bounded by
/// `MAX_REGEX_HTML`.
pub fn regex_response(url: &str) -> Vec<u8> {
    let Some(value) = regex_value(url) else {
        warn!("regex URL without a value parameter: {url}");
        return assemble(501, "text/html", b"");
    };
    let re = match Regex::new(value) {
        Ok(re) => re,
        Err(e) => {
            warn!("could not compile pattern {value:?}: {e}");
            return assemble(501, "text/html", b"");
        }
    };

    let mut html = format!(
        "<html><body><h1>Matches for {}</h1><ul>",
        escape(value)
    );
    for m in re.find_iter(REGEX_CORPUS) {
        let item = format!("<li>{}</li>", escape(m.as_str()));
        if html.len() + item.len() + 32 > MAX_REGEX_HTML {
            break;
        }
        html.push_str(&item);
    }
    html.push_str("</ul></body></html>");
    html.truncate(MAX_REGEX_HTML);
    assemble(200, "text/html", html.as_bytes())
}

fn regex_value(url: &str) -> Option<&str> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|kv| kv.strip_prefix("value="))
}

/// Resolve a URL to a path under the document root. `None` means the path
/// escapes the root.
fn url_to_path(url: &str, doc_root: &Path) -> Option<PathBuf> {
    let path = url.split_once('?').map_or(url, |(p, _)| p);
    let path = path.trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };
    let rel = Path::new(path);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(doc_root.join(rel))
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

fn assemble(code: u16, mime: &str, body: &[u8]) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        code,
        reason(code),
        mime,
        body.len()
    );
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn doc_root_with(name: &str, contents: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = fs::File::create(dir.path().join(name)).expect("create");
        f.write_all(contents).expect("write");
        dir
    }

    fn split_response(resp: &[u8]) -> (String, Vec<u8>) {
        let pos = resp
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator");
        (
            String::from_utf8(resp[..pos].to_vec()).expect("header utf8"),
            resp[pos + 4..].to_vec(),
        )
    }

    #[test]
    fn existing_file_is_served_verbatim() {
        let dir = doc_root_with("index.html", b"<h1>hi</h1>");
        let resp = file_response("/index.html", dir.path());
        let (head, body) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html"));
        assert!(head.contains("Content-Length: 11"));
        assert_eq!(body, b"<h1>hi</h1>");
    }

    #[test]
    fn missing_file_is_404_with_empty_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resp = file_response("/missing", dir.path());
        let (head, body) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Type: text/html"));
        assert!(head.contains("Content-Length: 0"));
        assert!(body.is_empty());
    }

    #[test]
    fn directory_is_404() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");
        let resp = file_response("/sub", dir.path());
        let (head, _) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = doc_root_with("a.txt", b"x");
        let resp = file_response("/../a.txt", dir.path());
        let (head, _) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn bare_slash_serves_index() {
        let dir = doc_root_with("index.html", b"root");
        let resp = file_response("/", dir.path());
        let (head, body) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(body, b"root");
    }

    #[test]
    fn mime_follows_extension() {
        let dir = doc_root_with("data.json", b"{}");
        let resp = file_response("/data.json", dir.path());
        let (head, _) = split_response(&resp);
        assert!(head.contains("Content-Type: application/json"));
    }

    #[test]
    fn regex_match_report() {
        let resp = regex_response("/regex?value=abc");
        let (head, body) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = String::from_utf8(body).expect("utf8");
        assert!(body.contains("Matches for abc"));
    }

    #[test]
    fn regex_finds_corpus_matches() {
        let resp = regex_response("/regex?value=qu[a-z]+");
        let (_, body) = split_response(&resp);
        let body = String::from_utf8(body).expect("utf8");
        assert!(body.contains("<li>quick</li>"));
        assert!(body.contains("<li>quartz</li>"));
    }

    #[test]
    fn regex_without_value_is_501() {
        let (head, body) = split_response(&regex_response("/regex"));
        assert!(head.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn invalid_pattern_is_501() {
        let (head, _) = split_response(&regex_response("/regex?value=["));
        assert!(head.starts_with("HTTP/1.1 501"));
    }

    #[test]
    fn regex_body_is_bounded() {
        // A pattern matching every character produces the largest report.
        let resp = regex_response("/regex?value=.");
        let (head, body) = split_response(&resp);
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(body.len() <= MAX_REGEX_HTML);
    }

    #[test]
    fn content_length_always_matches_body() {
        for resp in [
            regex_response("/regex?value=fox"),
            regex_response("/regex"),
            bad_request(),
        ] {
            let (head, body) = split_response(&resp);
            let len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .expect("content-length header")
                .parse()
                .expect("numeric length");
            assert_eq!(len, body.len());
        }
    }
}
