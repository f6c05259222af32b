//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves one static body at any path. Honors `Range: bytes=a-b` with 206
//! unless ranges are switched off, and can misbehave in a few controlled ways
//! (HTML content type, dropped first connection, slow bodies).

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    pub content_type: &'static str,
    /// Sent as `Content-Disposition: attachment; filename="..."`.
    pub attachment_name: Option<&'static str>,
    /// The first GET announces its full length but closes after this many
    /// body bytes.
    pub cut_first_response_at: Option<usize>,
    /// Write the body in pieces of this size with a pause after each.
    pub throttle: Option<(usize, Duration)>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            content_type: "application/octet-stream",
            attachment_name: None,
            cut_first_response_at: None,
            throttle: None,
        }
    }
}

/// Handle to a running server. The server lives until the process exits.
pub struct TestServer {
    base: String,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl TestServer {
    /// URL of the served file, named `name`.
    pub fn url(&self, name: &str) -> String {
        format!("{}{}", self.base, name)
    }

    /// GET requests handled so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `Range` header values of all GET requests, in arrival order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

pub fn start(body: Vec<u8>) -> TestServer {
    start_with_options(body, ServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let opts = Arc::new(opts);
    let requests = Arc::new(AtomicUsize::new(0));
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let first_cut = Arc::new(AtomicBool::new(false));

    let server = TestServer {
        base: format!("http://127.0.0.1:{}/", port),
        requests: requests.clone(),
        ranges: ranges.clone(),
    };
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = Arc::clone(&opts);
            let requests = Arc::clone(&requests);
            let ranges = Arc::clone(&ranges);
            let first_cut = Arc::clone(&first_cut);
            thread::spawn(move || {
                let Some(range) = read_request(&stream) else {
                    return;
                };
                requests.fetch_add(1, Ordering::SeqCst);
                ranges.lock().unwrap().push(range.clone());
                let cut = match opts.cut_first_response_at {
                    Some(at) if !first_cut.swap(true, Ordering::SeqCst) => Some(at),
                    _ => None,
                };
                respond(stream, &body, &opts, range.as_deref(), cut);
            });
        }
    });
    server
}

/// Read the request head; returns the raw `Range` value, if any.
fn read_request(mut stream: &TcpStream) -> Option<Option<String>> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let mut lines = head.lines();
    let method = lines.next()?.split_whitespace().next()?.to_string();
    if !method.eq_ignore_ascii_case("GET") {
        return None;
    }
    let range = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .map(|(_, value)| value.trim().to_string());
    Some(range)
}

/// `bytes=a-b` / `bytes=a-` into an inclusive `(start, end)` clamped to `total`.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (a, b) = bounds.split_once('-')?;
    let start: u64 = a.trim().parse().ok()?;
    let end = match b.trim() {
        "" => total.saturating_sub(1),
        b => b.parse::<u64>().ok()?.min(total.saturating_sub(1)),
    };
    (start <= end).then_some((start, end))
}

fn respond(
    mut stream: TcpStream,
    body: &[u8],
    opts: &ServerOptions,
    range: Option<&str>,
    cut: Option<usize>,
) {
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let total = body.len() as u64;
    let mut head = String::new();
    let slice = match range.filter(|_| opts.support_ranges) {
        Some(value) => match parse_range(value, total) {
            Some((start, end)) => {
                head.push_str("HTTP/1.1 206 Partial Content\r\n");
                head.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", start, end, total));
                &body[start as usize..=end as usize]
            }
            None => {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    total
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
        },
        None => {
            head.push_str("HTTP/1.1 200 OK\r\n");
            body
        }
    };
    head.push_str(&format!("Content-Length: {}\r\n", slice.len()));
    head.push_str(&format!("Content-Type: {}\r\n", opts.content_type));
    if opts.support_ranges {
        head.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(name) = opts.attachment_name {
        head.push_str(&format!("Content-Disposition: attachment; filename=\"{}\"\r\n", name));
    }
    head.push_str("Connection: close\r\n\r\n");
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let slice = match cut {
        Some(at) => &slice[..at.min(slice.len())],
        None => slice,
    };
    match opts.throttle {
        Some((piece, pause)) => {
            for part in slice.chunks(piece.max(1)) {
                if stream.write_all(part).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(pause);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
    let _ = stream.flush();
    if cut.is_some() {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}
