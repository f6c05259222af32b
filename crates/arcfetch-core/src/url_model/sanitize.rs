//! File name sanitization.

const NAME_MAX: usize = 255;

/// Replace characters that cannot appear in a file name with `_`.
///
/// Path separators, NUL and control characters are invalid. Surrounding
/// whitespace is trimmed, `.` and `..` become empty, and the result is cut to
/// 255 bytes. An empty result means the caller must pick a fallback.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == '\0' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim();
    if trimmed == "." || trimmed == ".." {
        return String::new();
    }
    if trimmed.len() <= NAME_MAX {
        return trimmed.to_string();
    }
    let mut take = NAME_MAX;
    while !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_become_underscores() {
        assert_eq!(sanitize_file_name("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_file_name("x\0y\n.bin"), "x_y_.bin");
    }

    #[test]
    fn keeps_inner_spaces_and_dots() {
        assert_eq!(sanitize_file_name("  My Mod v1.2.zip "), "My Mod v1.2.zip");
    }

    #[test]
    fn dot_names_are_empty() {
        assert_eq!(sanitize_file_name(".."), "");
        assert_eq!(sanitize_file_name("   "), "");
    }

    #[test]
    fn long_names_are_cut_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_file_name(&long);
        assert!(out.len() <= 255);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
