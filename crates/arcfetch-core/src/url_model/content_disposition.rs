//! File names announced in `Content-Disposition`.

/// File name from a `Content-Disposition` value.
///
/// `filename*=charset'lang'value` (RFC 5987) wins over `filename=`; quoted
/// values may contain `;` and backslash escapes. Empty names count as absent.
pub fn parse_content_disposition_filename(header_value: &str) -> Option<String> {
    let mut plain = None;
    for (name, value) in params(header_value) {
        if name.eq_ignore_ascii_case("filename*") {
            if let Some(decoded) = extended_value(&value).filter(|v| !v.is_empty()) {
                return Some(decoded);
            }
        } else if name.eq_ignore_ascii_case("filename") && !value.is_empty() {
            plain = Some(value);
        }
    }
    plain
}

/// `name=value` parameters, with quoted values unescaped.
fn params(header_value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = header_value;
    let first = rest.find(';').unwrap_or(rest.len());
    if !rest[..first].contains('=') {
        // Disposition type.
        rest = &rest[first..];
    }
    loop {
        rest = rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
        let Some(eq) = rest.find('=') else {
            break;
        };
        let name = rest[..eq].trim().to_string();
        rest = rest[eq + 1..].trim_start();
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let (value, consumed) = unquote(quoted);
            rest = &quoted[consumed..];
            value
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        out.push((name, value));
    }
    out
}

/// Read a quoted string body up to its closing quote. Returns the unescaped
/// value and the bytes consumed, closing quote included.
fn unquote(s: &str) -> (String, usize) {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => {
                value.push(c);
                escaped = false;
            }
            '\\' => escaped = true,
            '"' => return (value, i + 1),
            _ => value.push(c),
        }
    }
    (value, s.len())
}

/// Decode `charset'lang'pct-encoded`. UTF-8 and ISO-8859-1 are understood.
fn extended_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;
    let bytes = percent_decode_bytes(encoded);
    if charset.eq_ignore_ascii_case("utf-8") {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else if charset.eq_ignore_ascii_case("iso-8859-1") {
        Some(bytes.iter().map(|&b| b as char).collect())
    } else {
        None
    }
}

/// Percent-decode `input`; invalid escapes are kept as they are and invalid
/// UTF-8 is replaced.
pub(super) fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&percent_decode_bytes(input)).into_owned()
}

fn percent_decode_bytes(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = bytes
                .get(i + 1..i + 3)
                .filter(|p| p.iter().all(u8::is_ascii_hexdigit))
                .and_then(|p| u8::from_str_radix(std::str::from_utf8(p).ok()?, 16).ok());
            if let Some(b) = pair {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
