//! Destination-path helpers.
//!
//! Produced files land at `<root>/<sanitized author>/<task_id>_<sanitized
//! title>.<ext>`. Sanitization keeps alphanumerics, folds whitespace runs to
//! a single `_` and drops everything else, so titles in any script stay
//! recognizable while the path is safe on every filesystem.

use std::path::{Path, PathBuf};

/// Sanitize one path component (author or title).
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_underscore = false;
        } else if c.is_whitespace() || c == '_' {
            if !last_underscore {
                out.push('_');
                last_underscore = true;
            }
        }
        // every other character is dropped
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Final destination for a task's output file.
pub fn download_path(root: &Path, author: &str, task_id: &str, title: &str, ext: &str) -> PathBuf {
    root.join(sanitize_component(author))
        .join(format!("{}_{}{}", task_id, sanitize_component(title), ext))
}

/// Companion temporary path (`<file>.temp`), removed once the real file is
/// in place.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(".temp");
    path.with_file_name(name)
}

/// Directory holding `part_k.tmp` files for the multi-range downloader:
/// a task-id-named subdirectory next to the final file.
pub fn parts_dir(final_path: &Path, task_id: &str) -> PathBuf {
    final_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(task_id)
}

/// Strip the `{task_id}_` prefix for user-facing attachment names.
pub fn display_file_name(path: &Path, task_id: &str) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    match name.strip_prefix(&format!("{task_id}_")) {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_alphanumerics_and_folds_whitespace() {
        assert_eq!(sanitize_component("My Great  Video!"), "My_Great_Video");
        assert_eq!(sanitize_component("a\tb\nc"), "a_b_c");
    }

    #[test]
    fn drops_special_characters_entirely() {
        assert_eq!(sanitize_component("h:e/l\\l*o?"), "hello");
    }

    #[test]
    fn unicode_titles_survive() {
        assert_eq!(sanitize_component("Видео про котов"), "Видео_про_котов");
    }

    #[test]
    fn empty_input_falls_back() {
        assert_eq!(sanitize_component("///"), "video");
        assert_eq!(sanitize_component("   "), "video");
    }

    #[test]
    fn download_path_layout() {
        let p = download_path(Path::new("/dl"), "Some Author", "t-123", "My Clip", ".mp4");
        assert_eq!(p, PathBuf::from("/dl/Some_Author/t-123_My_Clip.mp4"));
    }

    #[test]
    fn temp_path_appends_suffix() {
        assert_eq!(
            temp_path(Path::new("/dl/a/x.mp4")),
            PathBuf::from("/dl/a/x.mp4.temp")
        );
    }

    #[test]
    fn display_name_strips_task_prefix() {
        let p = PathBuf::from("/dl/a/t-1_My_Clip.mp4");
        assert_eq!(display_file_name(&p, "t-1"), "My_Clip.mp4");
        assert_eq!(display_file_name(&p, "other"), "t-1_My_Clip.mp4");
    }
}
