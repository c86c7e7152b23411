//! Name and path validation for everything a caller can type.

use std::path::Path;

use crate::error::{Result, StoreError};
use crate::render;

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const MAX_NAME_BYTES: usize = 255;

/// Extension given to new documents whose name carries none we can preview.
pub const DEFAULT_EXTENSION: &str = "md";

/// Returns whether `name` is safe to use as a single file or directory name.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_BYTES
        && !name.starts_with('.')
        && !name.contains(FORBIDDEN)
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if validate_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Trims the name and appends `.md` unless it already ends in a previewable
/// extension.
pub fn normalize_document_name(name: &str) -> String {
    let name = name.trim();
    match extension_of(name) {
        Some(ext) if render::is_previewable(ext) => name.to_string(),
        _ => format!("{name}.{DEFAULT_EXTENSION}"),
    }
}

/// The extension of a file name without its dot, if any.
pub fn extension_of(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|e| e.to_str())
}

/// Validates a root-relative, `/`-separated path and returns its normalized
/// form. The root itself is `""`.
pub fn validate_relative_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        if part.is_empty() {
            continue;
        }
        if !validate_name(part) {
            return Err(StoreError::InvalidName(path.to_string()));
        }
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Joins a normalized directory path and a validated name into an index key.
pub fn join_key(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Splits a key into its parent directory and final component.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_names() {
        for bad in [
            "", ".hidden", "a/b", "a\\b", "c:", "what?", "star*", "\"q\"", "<x>", "pipe|",
        ] {
            assert!(!validate_name(bad), "{bad:?} should be rejected");
        }
        assert!(!validate_name(&"a".repeat(256)));
        assert!(validate_name(&"a".repeat(255)));
    }

    #[test]
    fn byte_length_counts_not_chars() {
        // 86 three-byte characters = 258 bytes
        assert!(!validate_name(&"文".repeat(86)));
        assert!(validate_name(&"文".repeat(85)));
    }

    #[test]
    fn validation_is_idempotent() {
        for name in ["notes.md", "日记.md", "..", "a b c", "x|y"] {
            assert_eq!(validate_name(name), validate_name(name));
        }
    }

    #[test]
    fn normalize_appends_markdown_extension() {
        assert_eq!(normalize_document_name("notes"), "notes.md");
        assert_eq!(normalize_document_name(" notes.md "), "notes.md");
        assert_eq!(normalize_document_name("main.rs"), "main.rs");
        assert_eq!(normalize_document_name("v1.2"), "v1.2.md");
    }

    #[test]
    fn relative_paths_are_normalized() {
        assert_eq!(validate_relative_path("").unwrap(), "");
        assert_eq!(validate_relative_path("/").unwrap(), "");
        assert_eq!(validate_relative_path("/a//b/").unwrap(), "a/b");
        assert!(validate_relative_path("../etc").is_err());
        assert!(validate_relative_path("a/./b").is_err());
        assert!(validate_relative_path("a/.git").is_err());
    }

    #[test]
    fn keys_split_and_join() {
        assert_eq!(join_key("", "a.md"), "a.md");
        assert_eq!(join_key("x/y", "a.md"), "x/y/a.md");
        assert_eq!(split_key("x/y/a.md"), ("x/y", "a.md"));
        assert_eq!(split_key("a.md"), ("", "a.md"));
    }
}
