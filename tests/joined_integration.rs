//! End-to-end tests for joined mode: one connection worker parses, builds
//! and answers inline. Real sockets, real io_uring, loopback only.

mod common;

use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};

use qhttpd::policy::Policy;
use qhttpd::response::BAD_REQUEST_RESPONSE;
use qhttpd::supervisor::ServerConfig;

const PORT: u16 = 9481;

fn addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, PORT)
}

#[test]
fn joined_mode_serves_one_request_per_connection() {
    let doc_root = tempfile::tempdir().expect("tempdir");
    let index_bytes = b"<html><body>hello from qhttpd</body></html>";
    std::fs::write(doc_root.path().join("index.html"), index_bytes).expect("write index");

    let config = ServerConfig {
        conn_workers: 1,
        compute_workers: 1,
        split: false,
        policy: Policy::OneToOne,
        ip: None,
        port: PORT,
        doc_root: doc_root.path().to_path_buf(),
    };
    let server = common::launch(config, addr());

    // An existing file comes back byte-identical with a matching length.
    let resp = common::roundtrip(addr(), b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(common::status_line(&resp), "HTTP/1.1 200 OK");
    assert_eq!(
        common::header_value(&resp, "content-length"),
        Some(index_bytes.len().to_string().as_str())
    );
    assert_eq!(
        common::header_value(&resp, "content-type"),
        Some("text/html")
    );
    assert_eq!(common::body(&resp), index_bytes);

    // A missing path is a 404 with an empty body.
    let resp = common::roundtrip(addr(), b"GET /missing HTTP/1.1\r\n\r\n");
    assert_eq!(common::status_line(&resp), "HTTP/1.1 404 Not Found");
    assert_eq!(common::header_value(&resp, "content-length"), Some("0"));
    assert!(common::body(&resp).is_empty());

    // A regex URL returns HTML derived from the pattern.
    let resp = common::roundtrip(addr(), b"GET /regex?value=abc HTTP/1.1\r\n\r\n");
    assert_eq!(common::status_line(&resp), "HTTP/1.1 200 OK");
    let html = String::from_utf8(common::body(&resp).to_vec()).expect("html body");
    assert!(html.contains("abc"));
    assert_eq!(
        common::header_value(&resp, "content-length"),
        Some(html.len().to_string().as_str())
    );

    // Garbage gets exactly the fixed bad-request header, and the connection
    // is re-armed for the next read.
    let mut stream = common::connect(addr());
    stream.write_all(b"NOT_HTTP garbage").expect("write garbage");
    let resp = common::read_response(&mut stream);
    assert_eq!(resp, BAD_REQUEST_RESPONSE);

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\n\r\n")
        .expect("write follow-up");
    let resp = common::read_response(&mut stream);
    assert_eq!(common::status_line(&resp), "HTTP/1.1 200 OK");
    assert_eq!(common::body(&resp), index_bytes);

    // One listener registered for the single connection worker.
    assert_eq!(server.registry().listeners().len(), 1);
}
