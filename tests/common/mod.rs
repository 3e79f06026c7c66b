#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use qhttpd::supervisor::{self, Server, ServerConfig};

/// Start a server and wait until its first listener answers.
pub fn launch(config: ServerConfig, probe: SocketAddrV4) -> Server {
    let server = supervisor::launch(config).expect("server launch");
    drop(connect(probe));
    server
}

/// Connect with retries; workers bind on their own threads.
pub fn connect(addr: SocketAddrV4) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(e) => {
                if Instant::now() > deadline {
                    panic!("connect {addr}: {e}");
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// One request/response exchange on a fresh connection.
pub fn roundtrip(addr: SocketAddrV4, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(request).expect("write request");
    read_response(&mut stream)
}

/// Read one HTTP response: headers, then exactly `Content-Length` body
/// bytes. The connection stays open (the server re-arms it, not closes it).
pub fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).expect("read headers");
        assert!(n > 0, "connection closed before headers finished");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).expect("headers are utf8");
    let len = content_length(head);
    let total = head_end + 4 + len;
    while buf.len() < total {
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "connection closed before body finished");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf.truncate(total);
    buf
}

pub fn status_line(resp: &[u8]) -> &str {
    let end = find(resp, b"\r\n").expect("status line");
    std::str::from_utf8(&resp[..end]).expect("status line utf8")
}

pub fn body(resp: &[u8]) -> &[u8] {
    let head_end = find(resp, b"\r\n\r\n").expect("header terminator");
    &resp[head_end + 4..]
}

pub fn header_value<'a>(resp: &'a [u8], name: &str) -> Option<&'a str> {
    let head_end = find(resp, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&resp[..head_end]).ok()?;
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .expect("content-length header")
}

fn find(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}
