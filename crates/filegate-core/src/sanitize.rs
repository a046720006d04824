//! Client filename sanitization.
//!
//! Uploaded names are never trusted: only the final path component survives,
//! anything outside `[A-Za-z0-9._-]` becomes `_`, and dot runs that could form
//! traversal sequences are collapsed.

use uuid::Uuid;

pub const MAX_FILENAME_LENGTH: usize = 255;

/// Longest extension kept intact when a name has to be truncated.
const MAX_PRESERVED_EXTENSION: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedFilename {
    pub safe_name: String,
    /// Lower-case, without the dot. Empty when the name has none.
    pub extension: String,
}

/// Turns a raw client filename into a name that is safe to join onto a
/// staging directory. Never returns an empty name or one containing a path
/// separator; degenerate input gets a random `file_<token>` name.
pub fn sanitize(raw: &str) -> SanitizedFilename {
    let base = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw);

    let mapped: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let truncated = truncate_keeping_extension(&mapped);
    let collapsed = collapse_dot_runs(&truncated);
    let safe_name = collapsed.trim_matches('.');

    if safe_name.is_empty() {
        return SanitizedFilename {
            safe_name: format!("file_{}", Uuid::new_v4().simple()),
            extension: String::new(),
        };
    }

    SanitizedFilename {
        safe_name: safe_name.to_string(),
        extension: extension_of(safe_name),
    }
}

/// Lower-case extension of an already-sanitized name.
pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => name[idx + 1..].to_ascii_lowercase(),
        None => String::new(),
    }
}

// Input is ASCII at this point, so byte offsets are char boundaries.
fn truncate_keeping_extension(name: &str) -> String {
    if name.len() <= MAX_FILENAME_LENGTH {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(idx) if name.len() - idx - 1 <= MAX_PRESERVED_EXTENSION => {
            let ext = &name[idx + 1..];
            let keep = MAX_FILENAME_LENGTH - ext.len() - 1;
            format!("{}.{}", &name[..keep], ext)
        }
        _ => name[..MAX_FILENAME_LENGTH].to_string(),
    }
}

fn collapse_dot_runs(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dot = false;
    for c in name.chars() {
        if c == '.' {
            if !prev_dot {
                out.push(c);
            }
            prev_dot = true;
        } else {
            out.push(c);
            prev_dot = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_traversal() {
        assert_eq!(sanitize("../../etc/passwd").safe_name, "passwd");
        assert_eq!(sanitize("..\\..\\boot.ini").safe_name, "boot.ini");
        assert_eq!(sanitize("foo/../bar.png").safe_name, "bar.png");
        assert_eq!(sanitize("a..b.png").safe_name, "a.b.png");
    }

    #[test]
    fn sanitize_accepts_valid_names() {
        let s = sanitize("my-file_1.jpg");
        assert_eq!(s.safe_name, "my-file_1.jpg");
        assert_eq!(s.extension, "jpg");
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        let s = sanitize("my photo (1).JPG");
        assert_eq!(s.safe_name, "my_photo__1_.JPG");
        assert_eq!(s.extension, "jpg");
        assert_eq!(sanitize("résumé.pdf").safe_name, "r_sum_.pdf");
    }

    #[test]
    fn sanitize_without_extension() {
        let s = sanitize("Makefile");
        assert_eq!(s.safe_name, "Makefile");
        assert_eq!(s.extension, "");
    }

    #[test]
    fn sanitize_strips_leading_and_trailing_dots() {
        let s = sanitize(".hidden.");
        assert_eq!(s.safe_name, "hidden");
        assert_eq!(s.extension, "");
    }

    #[test]
    fn sanitize_degenerate_input_gets_fallback() {
        for raw in ["", "..", "....", "/", "dir/", "\\"] {
            let s = sanitize(raw);
            assert!(s.safe_name.starts_with("file_"), "{raw:?} -> {}", s.safe_name);
            assert!(!s.safe_name.contains('/'));
            assert_eq!(s.extension, "");
        }
    }

    #[test]
    fn sanitize_truncates_but_keeps_extension() {
        let raw = format!("{}.png", "a".repeat(400));
        let s = sanitize(&raw);
        assert_eq!(s.safe_name.len(), MAX_FILENAME_LENGTH);
        assert!(s.safe_name.ends_with(".png"));
        assert_eq!(s.extension, "png");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "../../etc/passwd",
            "my photo (1).JPG",
            "a..b...c.tar.gz",
            ".hidden.",
            "ünïcödé name.webp",
            "C:\\Users\\me\\Desktop\\scan 01.pdf",
        ];
        let long = format!("{}...{}.jpeg", "x".repeat(250), "y".repeat(30));
        for raw in inputs.iter().copied().chain(std::iter::once(long.as_str())) {
            let once = sanitize(raw);
            let twice = sanitize(&once.safe_name);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn sanitize_output_never_contains_separators() {
        for raw in ["a/b\\c.txt", "x:y*z?.doc", "<script>.html"] {
            let s = sanitize(raw);
            assert!(!s.safe_name.contains('/') && !s.safe_name.contains('\\'));
            assert!(s
                .safe_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
        }
    }
}
