//! File categories derived from extensions.
//!
//! Categories drive per-category target folders; "Auto" means "detect from
//! the filename when one is known".

/// The category names in display order, starting with the Auto placeholder.
pub const CATEGORY_NAMES: [&str; 8] = [
    "Auto",
    "Video",
    "Audio",
    "Images",
    "Archives",
    "Documents",
    "Programs",
    "Other",
];

/// Detects a coarse content category from a file path's extension.
#[must_use]
pub fn detect_category(file_path: &str) -> &'static str {
    let lower = file_path.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    match ext {
        "mp4" | "mkv" | "mov" | "avi" | "webm" => "Video",
        "mp3" | "wav" | "aac" | "flac" | "m4a" | "ogg" => "Audio",
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => "Images",
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" => "Archives",
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "md" => "Documents",
        "dmg" | "exe" | "msi" | "pkg" | "app" => "Programs",
        _ => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_category_by_extension() {
        assert_eq!(detect_category("/downloads/movie.MKV"), "Video");
        assert_eq!(detect_category("song.flac"), "Audio");
        assert_eq!(detect_category("photo.jpeg"), "Images");
        assert_eq!(detect_category("bundle.tar"), "Archives");
        assert_eq!(detect_category("paper.pdf"), "Documents");
        assert_eq!(detect_category("installer.exe"), "Programs");
    }

    #[test]
    fn test_detect_category_unknown_is_other() {
        assert_eq!(detect_category("data.xyz"), "Other");
        assert_eq!(detect_category("no_extension"), "Other");
        assert_eq!(detect_category(""), "Other");
    }
}
