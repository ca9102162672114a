use std::path::{Path, PathBuf};
use crate::errors::{AppError, Result};
use log::info;

/// Longest sanitized stem, in characters.
pub const MAX_FILENAME_CHARS: usize = 200;

/// Replaces characters that are unsafe on common filesystems with `_`,
/// collapses runs of `_`, trims, and caps the length.
pub fn sanitize_filename(filename: &str) -> String {
    let mapped: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    let capped: String = collapsed.chars().take(MAX_FILENAME_CHARS).collect();
    let trimmed = capped
        .trim_matches(|c: char| c == '_' || c == '.' || c.is_whitespace())
        .to_string();

    if trimmed.is_empty() {
        "download".to_string()
    } else if is_reserved_device_name(&trimmed) {
        // Windows resolves these to devices regardless of extension.
        let stem_len = trimmed.find('.').unwrap_or(trimmed.len());
        format!("{}_{}", &trimmed[..stem_len], &trimmed[stem_len..])
    } else {
        trimmed
    }
}

fn is_reserved_device_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or_default().trim_end().to_ascii_uppercase();
    match stem.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => ["COM", "LPT"].iter().any(|prefix| {
            stem.strip_prefix(prefix)
                .map_or(false, |n| n.len() == 1 && matches!(n.as_bytes()[0], b'1'..=b'9'))
        }),
    }
}

/// Output stem in the `<title> [<id>]` shape.
pub fn media_file_stem(title: &str, id: &str) -> String {
    format!("{} [{}]", sanitize_filename(title), sanitize_filename(id))
}

/// Atomically claims `<dir>/<stem>.<ext>`, or `<stem> (n).<ext>` for the
/// first free n. The returned path exists as an empty file owned by the caller.
pub async fn reserve_unique_path(dir: &Path, stem: &str, ext: &str) -> Result<PathBuf> {
    const MAX_SUFFIX: u32 = 10_000;

    for n in 0..MAX_SUFFIX {
        let name = if n == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{} ({}).{}", stem, n, ext)
        };
        let candidate = dir.join(name);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(AppError::Processing(format!(
        "No free file name for '{}.{}' in {:?}",
        stem, ext, dir
    )))
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("📁 [FS] Created directory: {:?}", path);
    }
    Ok(())
}

/// `0 B`, `512 B`, `1.5 KB`, `12.3 MB`, ...
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Decodes the handful of HTML entities that show up in page titles.
pub fn decode_html_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Generates a unique ID for downloads
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
