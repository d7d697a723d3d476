//! Filename derivation and path utilities for downloads.
//!
//! This module derives display names from URLs (including Content-Disposition
//! style query parameters used by object stores), normalizes hosts for domain
//! rules, recognizes GUID placeholder names, resolves unique target paths, and
//! reconciles persisted byte counts against what is actually on disk.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Matches `filename=` / `filename*=` payloads inside a decoded
/// Content-Disposition value.
#[allow(clippy::expect_used)]
static DISPOSITION_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"filename\*?=(?:UTF-8''|"?)([^";]+)"#).expect("disposition regex is valid")
});

/// Matches bare GUID filenames (e.g. from share links) that should be
/// replaced by a nicer URL-derived name when one exists.
#[allow(clippy::expect_used)]
static GUID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("guid regex is valid")
});

/// Upper bound on the ` (n)` suffix search in [`unique_file_path`].
const UNIQUE_SUFFIX_LIMIT: u32 = 10_000;

/// Strips a `file://` prefix, returning a plain filesystem path.
#[must_use]
pub fn normalize_file_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("file://") {
        return PathBuf::from(rest);
    }
    PathBuf::from(path)
}

/// Decodes a percent-encoded query value, mapping `+` to space first.
fn decode_query_value(value: &str) -> String {
    let plus_mapped = value.replace('+', " ");
    urlencoding::decode(&plus_mapped)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or(plus_mapped)
}

/// Extracts a filename from a (decoded) Content-Disposition value.
fn filename_from_disposition(value: &str) -> Option<String> {
    let decoded = decode_query_value(value);
    if decoded.is_empty() {
        return None;
    }
    DISPOSITION_FILENAME
        .captures(&decoded)
        .map(|c| c[1].trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Derives a filename from a URL.
///
/// Preference order:
/// 1. `response-content-disposition` / `content-disposition` / `rscd` query
///    parameters (CDN and object-store pre-signed URLs),
/// 2. a `filename` query parameter,
/// 3. the last path segment.
///
/// Returns an empty string when nothing usable is present.
#[must_use]
pub fn file_name_from_url(url: &Url) -> String {
    for key in ["response-content-disposition", "content-disposition", "rscd"] {
        let disp = url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned());
        if let Some(disp) = disp {
            if let Some(name) = filename_from_disposition(&disp) {
                return name;
            }
        }
    }

    if let Some((_, filename)) = url.query_pairs().find(|(k, _)| k == "filename") {
        let decoded = decode_query_value(&filename);
        if !decoded.is_empty() {
            return decoded;
        }
    }

    url.path_segments()
        .and_then(Iterator::last)
        .map(|segment| decode_query_value(segment))
        .unwrap_or_default()
}

/// Normalizes a host for domain-rule lookups: lowercased, scheme and path
/// stripped.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let mut h = host.trim().to_lowercase();
    if h.is_empty() {
        return h;
    }
    if h.contains("://") {
        if let Ok(parsed) = Url::parse(&h) {
            if let Some(parsed_host) = parsed.host_str() {
                h = parsed_host.to_lowercase();
            }
        }
    }
    if let Some(slash) = h.find('/') {
        h.truncate(slash);
    }
    h
}

/// Returns whether a filename is a bare GUID (placeholder names some hosts
/// hand out instead of the real filename).
#[must_use]
pub fn looks_like_guid_name(name: &str) -> bool {
    !name.is_empty() && GUID_NAME.is_match(name)
}

/// Returns the `.partN` temp path for segment `index` of `path`.
#[must_use]
pub fn segment_part_path(path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.part{index}", path.display()))
}

/// Returns the `.part` temp path used by single-stream transfers.
#[must_use]
pub fn single_part_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", path.display()))
}

fn candidate_taken(path: &Path) -> bool {
    path.exists() || single_part_path(path).exists()
}

/// Resolves a path that collides with nothing on disk.
///
/// A path counts as taken when either it or its `.part` sibling exists.
/// Collisions get ` (n)` appended before the extension. Applying the filter
/// to an already-free path is the identity.
#[must_use]
pub fn unique_file_path(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || !candidate_taken(path) {
        return path.to_path_buf();
    }

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    for i in 1..UNIQUE_SUFFIX_LIMIT {
        let name = match &extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = dir.join(name);
        if !candidate_taken(&candidate) {
            return candidate;
        }
    }
    path.to_path_buf()
}

/// Sums the bytes already persisted for a download.
///
/// Segment part files win over the single-stream `.part` sibling, which wins
/// over the final file itself.
#[must_use]
pub fn bytes_received_on_disk(path: &Path, segments: u32) -> u64 {
    if path.as_os_str().is_empty() {
        return 0;
    }

    let mut parts_total = 0;
    let mut any_parts = false;
    for i in 0..segments.max(1) {
        if let Ok(meta) = std::fs::metadata(segment_part_path(path, i)) {
            if meta.is_file() {
                any_parts = true;
                parts_total += meta.len();
            }
        }
    }
    if any_parts {
        return parts_total;
    }

    if let Ok(meta) = std::fs::metadata(single_part_path(path)) {
        if meta.is_file() {
            return meta.len();
        }
    }

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_from_url_path_segment() {
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        assert_eq!(file_name_from_url(&url), "report.pdf");
    }

    #[test]
    fn test_file_name_from_url_percent_decoded() {
        let url = Url::parse("https://example.com/files/annual%20report.pdf").unwrap();
        assert_eq!(file_name_from_url(&url), "annual report.pdf");
    }

    #[test]
    fn test_file_name_from_url_disposition_param() {
        let url = Url::parse(
            "https://cdn.example.com/blob?response-content-disposition=attachment%3B%20filename%3D%22video.mp4%22",
        )
        .unwrap();
        assert_eq!(file_name_from_url(&url), "video.mp4");
    }

    #[test]
    fn test_file_name_from_url_rfc5987_disposition() {
        let url = Url::parse(
            "https://cdn.example.com/blob?rscd=attachment%3B%20filename%2A%3DUTF-8%27%27archive.zip",
        )
        .unwrap();
        assert_eq!(file_name_from_url(&url), "archive.zip");
    }

    #[test]
    fn test_file_name_from_url_filename_param() {
        let url = Url::parse("https://example.com/get?filename=setup.exe").unwrap();
        assert_eq!(file_name_from_url(&url), "setup.exe");
    }

    #[test]
    fn test_normalize_host_strips_scheme_and_path() {
        assert_eq!(normalize_host("HTTPS://Example.COM/some/path"), "example.com");
        assert_eq!(normalize_host("  mirror.example.org  "), "mirror.example.org");
        assert_eq!(normalize_host("example.net/download"), "example.net");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn test_looks_like_guid_name() {
        assert!(looks_like_guid_name("6f9619ff-8b86-d011-b42d-00cf4fc964ff"));
        assert!(!looks_like_guid_name("report.pdf"));
        assert!(!looks_like_guid_name(""));
        assert!(!looks_like_guid_name("6f9619ff-8b86-d011-b42d-00cf4fc964ff.pdf"));
    }

    #[test]
    fn test_unique_file_path_free_path_is_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fresh.bin");
        assert_eq!(unique_file_path(&path), path);
        // Idempotent: applying twice yields the same answer.
        assert_eq!(unique_file_path(&unique_file_path(&path)), path);
    }

    #[test]
    fn test_unique_file_path_appends_counter() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("taken.bin");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(unique_file_path(&path), temp.path().join("taken (1).bin"));

        std::fs::write(temp.path().join("taken (1).bin"), b"x").unwrap();
        assert_eq!(unique_file_path(&path), temp.path().join("taken (2).bin"));
    }

    #[test]
    fn test_unique_file_path_considers_part_sibling() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pending.bin");
        std::fs::write(single_part_path(&path), b"partial").unwrap();
        assert_eq!(unique_file_path(&path), temp.path().join("pending (1).bin"));
    }

    #[test]
    fn test_bytes_received_on_disk_prefers_segment_parts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        std::fs::write(segment_part_path(&path, 0), vec![0u8; 100]).unwrap();
        std::fs::write(segment_part_path(&path, 2), vec![0u8; 50]).unwrap();
        std::fs::write(single_part_path(&path), vec![0u8; 999]).unwrap();
        assert_eq!(bytes_received_on_disk(&path, 4), 150);
    }

    #[test]
    fn test_bytes_received_on_disk_single_part_then_main() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        assert_eq!(bytes_received_on_disk(&path, 4), 0);

        std::fs::write(&path, vec![0u8; 10]).unwrap();
        assert_eq!(bytes_received_on_disk(&path, 4), 10);

        std::fs::write(single_part_path(&path), vec![0u8; 7]).unwrap();
        assert_eq!(bytes_received_on_disk(&path, 4), 7);
    }

    #[test]
    fn test_normalize_file_path_strips_file_scheme() {
        assert_eq!(
            normalize_file_path("file:///home/user/a.bin"),
            PathBuf::from("/home/user/a.bin")
        );
        assert_eq!(normalize_file_path("/plain/path"), PathBuf::from("/plain/path"));
    }
}
