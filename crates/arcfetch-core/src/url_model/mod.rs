//! File names for downloads: the name template taken from a request, the
//! name announced by the server, and sanitization for the local filesystem.

mod content_disposition;
mod path;
mod sanitize;

pub use content_disposition::parse_content_disposition_filename;
pub use path::{decoded_basename, strip_url_suffix};
pub use sanitize::sanitize_file_name;

/// Name used when nothing usable can be derived.
pub const FALLBACK_NAME: &str = "unnamed";

/// Name a new download starts out with: the caller's explicit `file_name`,
/// otherwise the decoded last path segment of the first URL.
///
/// Returns `None` when no URL parses and no name was given.
///
/// - `name_template(None, "https://example.com/files/My%20Mod.7z")` → `"My Mod.7z"`
/// - `name_template(Some("pack.zip"), "https://example.com/dl?id=4")` → `"pack.zip"`
pub fn name_template(file_name: Option<&str>, first_url: &str) -> Option<String> {
    if let Some(name) = file_name.filter(|n| !n.trim().is_empty()) {
        return Some(name.to_string());
    }
    let base = strip_url_suffix(first_url);
    url::Url::parse(base).ok()?;
    Some(decoded_basename(base).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_prefers_explicit_name() {
        assert_eq!(
            name_template(Some("pack.zip"), "https://example.com/archive.zip").as_deref(),
            Some("pack.zip")
        );
        assert_eq!(
            name_template(Some("  "), "https://example.com/archive.zip").as_deref(),
            Some("archive.zip")
        );
    }

    #[test]
    fn template_decodes_url_basename() {
        assert_eq!(
            name_template(None, "https://example.com/files/My%20Mod%20v2.7z").as_deref(),
            Some("My Mod v2.7z")
        );
    }

    #[test]
    fn template_ignores_suffix_after_angle_bracket() {
        assert_eq!(
            name_template(None, "https://example.com/a/mod.zip<mirror-hint>").as_deref(),
            Some("mod.zip")
        );
    }

    #[test]
    fn template_of_root_url_is_empty() {
        assert_eq!(name_template(None, "https://example.com/").as_deref(), Some(""));
    }

    #[test]
    fn unparsable_url_has_no_template() {
        assert_eq!(name_template(None, "not a url"), None);
    }
}
