//! Utility functions for file naming and path manipulation

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Image extensions accepted for cover files
const COVER_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Extension used when a cover URL does not reveal one
const DEFAULT_COVER_EXTENSION: &str = "jpg";

static RE_INVALID_CHARS: OnceLock<Regex> = OnceLock::new();
static RE_WHITESPACE: OnceLock<Regex> = OnceLock::new();

// Literal patterns, compilation cannot fail
#[allow(clippy::unwrap_used)]
fn invalid_chars() -> &'static Regex {
    RE_INVALID_CHARS.get_or_init(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap())
}

#[allow(clippy::unwrap_used)]
fn whitespace_runs() -> &'static Regex {
    RE_WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Build a filesystem-safe file stem from a title and author
///
/// Characters that are invalid on common filesystems are removed, runs of
/// whitespace collapse to one space, and names longer than `max_len`
/// characters are cut back to the last word boundary.
///
/// # Examples
///
/// ```
/// use harvest_dl::utils::sanitize_filename;
///
/// assert_eq!(
///     sanitize_filename("What? Why: How", "A.  Author", 160),
///     "What Why How - A. Author"
/// );
/// ```
pub fn sanitize_filename(title: &str, author: &str, max_len: usize) -> String {
    let combined = format!("{} - {}", title, author);
    let cleaned = invalid_chars().replace_all(&combined, "");
    let mut name = whitespace_runs().replace_all(&cleaned, " ").into_owned();

    if name.chars().count() > max_len {
        let truncated: String = name.chars().take(max_len).collect();
        name = match truncated.rsplit_once(' ') {
            Some((head, _)) => head.to_string(),
            None => truncated,
        };
    }

    name.trim().to_string()
}

/// Strip a single path component taken from untrusted metadata
///
/// Removes the same invalid characters as [`sanitize_filename`], so no path
/// separator survives, collapses whitespace and trims surrounding dots.
pub fn sanitize_component(value: &str) -> String {
    let cleaned = invalid_chars().replace_all(value, "");
    let cleaned = whitespace_runs().replace_all(&cleaned, " ");
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

/// Pick the file extension for a cover image from its URL
///
/// Returns the lowercase extension (without the dot) when the URL's last
/// path segment ends in a known image extension, `jpg` otherwise.
pub fn cover_extension(url: Option<&str>) -> &'static str {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return DEFAULT_COVER_EXTENSION;
    };

    let last_segment = match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
            .unwrap_or_default(),
        Err(_) => url.rsplit('/').next().unwrap_or_default().to_string(),
    };

    let extension = Path::new(&last_segment)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);

    extension
        .and_then(|ext| COVER_EXTENSIONS.iter().copied().find(|known| *known == ext))
        .unwrap_or(DEFAULT_COVER_EXTENSION)
}

/// Temporary path an artifact is streamed to before the final rename
///
/// The partial file lives next to the target (same filesystem, so the rename
/// is atomic) and is hidden: `dir/book.pdf` becomes `dir/.book.pdf.part`.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let partial = format!(".{}.part", name);

    match target.parent() {
        Some(parent) => parent.join(partial),
        None => PathBuf::from(partial),
    }
}
