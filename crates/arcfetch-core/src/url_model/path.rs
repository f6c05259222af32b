//! Basename of a URL path.

use super::content_disposition::percent_decode;

/// Part of a download URL before an optional `<...>` annotation.
pub fn strip_url_suffix(url: &str) -> &str {
    url.split('<').next().unwrap_or(url)
}

/// Percent-decoded last segment of the URL's path.
///
/// Returns `None` if the URL does not parse or its path is the root.
pub fn decoded_basename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().rsplit('/').find(|s| !s.is_empty())?;
    let decoded = percent_decode(segment);
    if decoded == "." || decoded == ".." {
        return None;
    }
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_of_nested_path() {
        assert_eq!(
            decoded_basename("https://example.com/a/b/file.7z").as_deref(),
            Some("file.7z")
        );
        assert_eq!(
            decoded_basename("https://example.com/dir/").as_deref(),
            Some("dir")
        );
    }

    #[test]
    fn basename_ignores_query() {
        assert_eq!(
            decoded_basename("https://example.com/file.zip?token=abc").as_deref(),
            Some("file.zip")
        );
    }

    #[test]
    fn root_has_no_basename() {
        assert_eq!(decoded_basename("https://example.com/"), None);
        assert_eq!(decoded_basename("https://example.com"), None);
    }

    #[test]
    fn suffix_is_cut_at_first_bracket() {
        assert_eq!(strip_url_suffix("http://h/f.zip<x>"), "http://h/f.zip");
        assert_eq!(strip_url_suffix("http://h/f.zip"), "http://h/f.zip");
    }
}
