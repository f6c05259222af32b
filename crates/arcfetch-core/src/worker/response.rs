//! Interpret the response headers of a chunk request.

use std::collections::HashMap;

use crate::url_model::parse_content_disposition_filename;

/// Parsed `Content-Range: bytes <start>-<end>/<total>` (end inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*` for the total.
    pub total: Option<u64>,
}

/// Metadata from the final response of a chunk request, reported once.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    /// URL the request was issued against (before redirects).
    pub url: String,
    pub status: u32,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    /// Size of the whole resource, if the response reveals it.
    pub total_size: Option<u64>,
    /// True when the server answered the range with 206 + Content-Range.
    pub chunkable: bool,
    /// Filename suggested by Content-Disposition.
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    /// Header map with lowercased names (last value wins).
    pub headers: HashMap<String, String>,
}

impl ResponseInfo {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .eq_ignore_ascii_case("text/html")
            })
            .unwrap_or(false)
    }
}

/// Header callback buffer: keeps only the lines of the latest response so
/// redirect hops and `100 Continue` blocks are discarded.
#[derive(Debug, Default)]
pub(crate) struct HeaderLines {
    lines: Vec<String>,
}

impl HeaderLines {
    pub(crate) fn push_raw(&mut self, data: &[u8]) {
        let line = String::from_utf8_lossy(data);
        let line = line.trim_end();
        if line.starts_with("HTTP/") {
            self.lines.clear();
        }
        if !line.is_empty() {
            self.lines.push(line.to_string());
        }
    }

    pub(crate) fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Build a `ResponseInfo` from the header lines of one response.
pub(crate) fn parse_response(url: &str, lines: &[String]) -> ResponseInfo {
    let mut info = ResponseInfo {
        url: url.to_string(),
        ..ResponseInfo::default()
    };

    for line in lines {
        let line = line.trim();
        if line.starts_with("HTTP/") {
            info.status = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "content-length" => info.content_length = value.parse().ok(),
            "content-range" => info.content_range = parse_content_range(value),
            "content-disposition" => {
                info.file_name = parse_content_disposition_filename(value);
            }
            "content-type" => info.content_type = Some(value.to_string()),
            _ => {}
        }
        info.headers.insert(name, value.to_string());
    }

    info.chunkable = info.status == 206 && info.content_range.is_some();
    info.total_size = if info.status == 206 {
        info.content_range.and_then(|r| r.total)
    } else if (200..300).contains(&info.status) {
        info.content_length
    } else {
        None
    };
    info
}

/// Parse a `Content-Range` value such as `bytes 0-99/1000` or `bytes 0-99/*`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partial_content_reveals_total_and_chunkable() {
        let info = parse_response(
            "http://h/f.zip",
            &lines(&[
                "HTTP/1.1 206 Partial Content",
                "Content-Length: 100",
                "Content-Range: bytes 0-99/10000000",
                "Content-Type: application/zip",
            ]),
        );
        assert_eq!(info.status, 206);
        assert!(info.chunkable);
        assert_eq!(info.total_size, Some(10_000_000));
        assert_eq!(info.content_length, Some(100));
        assert!(!info.is_html());
        assert_eq!(info.headers.get("content-type").map(String::as_str), Some("application/zip"));
    }

    #[test]
    fn full_body_is_not_chunkable() {
        let info = parse_response(
            "http://h/f",
            &lines(&["HTTP/1.1 200 OK", "Content-Length: 5000"]),
        );
        assert!(!info.chunkable);
        assert_eq!(info.total_size, Some(5000));
    }

    #[test]
    fn html_detection_ignores_parameters() {
        let info = parse_response(
            "http://h/",
            &lines(&["HTTP/2 200", "content-type: Text/HTML; charset=utf-8"]),
        );
        assert_eq!(info.status, 200);
        assert!(info.is_html());
    }

    #[test]
    fn content_disposition_filename() {
        let info = parse_response(
            "http://h/dl?id=1",
            &lines(&[
                "HTTP/1.1 200 OK",
                "Content-Disposition: attachment; filename=\"real-mod.7z\"",
            ]),
        );
        assert_eq!(info.file_name.as_deref(), Some("real-mod.7z"));
    }

    #[test]
    fn header_lines_drop_redirect_hops() {
        let mut h = HeaderLines::default();
        h.push_raw(b"HTTP/1.1 302 Found\r\n");
        h.push_raw(b"Location: http://other/\r\n");
        h.push_raw(b"\r\n");
        assert_eq!(h.lines().len(), 2);
        h.push_raw(b"HTTP/1.1 206 Partial Content\r\n");
        h.push_raw(b"Content-Range: bytes 5-9/10\r\n");
        assert_eq!(h.lines().len(), 2);
        assert!(h.lines()[0].contains("206"));
    }

    #[test]
    fn content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some(ContentRange { start: 100, end: 199, total: Some(1000) })
        );
        assert_eq!(
            parse_content_range("bytes 0-0/*"),
            Some(ContentRange { start: 0, end: 0, total: None })
        );
        assert_eq!(parse_content_range("bytes */1000"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 9-1/10"), None);
    }
}
