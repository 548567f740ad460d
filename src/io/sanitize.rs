//! File name sanitization.
//!
//! Pure functions mapping a requested file name to one the filesystem will accept.
//! Names that need changing get a `renamed_` prefix, lose their illegal characters
//! and keep their extension. The same input always produces the same output.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix marking a file whose requested name had to be changed.
pub const RENAMED_PREFIX: &str = "renamed_";

/// Characters rejected by at least one of the filesystems we write to.
static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*%\x00-\x1F\x7F]"#).expect("illegal character pattern"));

/// Device names Windows refuses regardless of extension.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Checks whether a file name would be rejected and has to be renamed.
pub fn needs_rename(name: &str) -> bool {
    if ILLEGAL_CHARS.is_match(name) || name.ends_with('.') || name.ends_with(' ') {
        return true;
    }

    let device = name.split('.').next().unwrap_or(name).trim_end();
    RESERVED_NAMES.iter().any(|reserved| reserved.eq_ignore_ascii_case(device))
}

/// Returns a filesystem-safe version of `name`, borrowing it when no change is needed.
pub fn sanitize_file_name(name: &str) -> Cow<'_, str> {
    if !needs_rename(name) {
        return Cow::Borrowed(name);
    }

    let (stem, extension) = split_extension(name);
    let stem = strip_illegal(stem);
    let extension = strip_illegal(extension);
    let stem = stem.trim_end_matches(['.', ' ']);
    let extension = extension.trim_end_matches(['.', ' ']);

    if extension.is_empty() {
        Cow::Owned(format!("{}{}", RENAMED_PREFIX, stem))
    } else {
        Cow::Owned(format!("{}{}.{}", RENAMED_PREFIX, stem, extension))
    }
}

/// Sanitizes the final component of `path`, leaving its directories alone.
pub fn sanitize_path(path: &Path) -> PathBuf {
    let Some(file_name) = path.file_name() else {
        return path.to_path_buf();
    };

    let file_name = file_name.to_string_lossy();
    match sanitize_file_name(&file_name) {
        Cow::Borrowed(_) => path.to_path_buf(),
        Cow::Owned(renamed) => path.with_file_name(renamed),
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, extension),
        _ => (name, ""),
    }
}

fn strip_illegal(part: &str) -> Cow<'_, str> {
    ILLEGAL_CHARS.replace_all(part, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_name_is_untouched() {
        assert!(!needs_rename("12345_wolf.jpg"));
        assert!(matches!(sanitize_file_name("12345_wolf.jpg"), Cow::Borrowed("12345_wolf.jpg")));
        assert_eq!(sanitize_file_name("ümlaut ök.png"), "ümlaut ök.png");
    }

    #[test]
    fn test_illegal_characters_are_renamed() {
        let renamed = sanitize_file_name("ooops+%\u{FFFD}!<>.txt");
        assert!(renamed.starts_with(RENAMED_PREFIX));
        assert!(renamed.ends_with(".txt"));
        assert_eq!(renamed, "renamed_ooops+\u{FFFD}!.txt");
    }

    #[test]
    fn test_sanitization_is_deterministic() {
        let first = sanitize_file_name("what?.gif").into_owned();
        let second = sanitize_file_name("what?.gif").into_owned();
        assert_eq!(first, second);
        assert_eq!(first, "renamed_what.gif");
    }

    #[test]
    fn test_sanitized_name_is_stable() {
        let once = sanitize_file_name("a|b*c.webm").into_owned();
        assert_eq!(sanitize_file_name(&once), once);
    }

    #[test]
    fn test_reserved_device_names() {
        assert!(needs_rename("CON.txt"));
        assert!(needs_rename("lpt1"));
        assert!(!needs_rename("console.txt"));
        assert_eq!(sanitize_file_name("nul.tar.gz"), "renamed_nul.tar.gz");
    }

    #[test]
    fn test_trailing_dots_and_spaces() {
        assert_eq!(sanitize_file_name("thread."), "renamed_thread");
        assert_eq!(sanitize_file_name("thread "), "renamed_thread");
    }

    #[test]
    fn test_illegal_extension_characters() {
        assert_eq!(sanitize_file_name("image.jp<g"), "renamed_image.jpg");
    }

    #[test]
    fn test_sanitize_path_only_changes_file_name() {
        let path = Path::new("downloads").join("b").join("a:b.png");
        let sanitized = sanitize_path(&path);
        assert_eq!(sanitized, Path::new("downloads").join("b").join("renamed_ab.png"));

        let clean = Path::new("downloads").join("b").join("ab.png");
        assert_eq!(sanitize_path(&clean), clean);
    }
}
