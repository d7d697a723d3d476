//! Platform-specific post-download operations behind one trait.
//!
//! The manager never branches on the OS itself; it calls these operations
//! and an implementation chosen at construction decides how to open files,
//! reveal them, extract archives, or run a user script.

use std::path::Path;

use tracing::{debug, warn};

/// Host-system operations used by post-download actions.
pub trait PlatformOps: Send + Sync {
    /// Opens `path` with the default application.
    fn open_file(&self, path: &Path);

    /// Shows `path` selected in the system file browser, or opens its
    /// directory when selection is not supported.
    fn reveal_in_folder(&self, path: &Path);

    /// Extracts `archive` into `dest_dir` with a system tool. Returns false
    /// when no tool handles the archive type.
    fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> bool;

    /// Runs an already-substituted shell command, detached.
    fn run_script(&self, command: &str);
}

fn spawn_detached(program: &str, args: &[&str]) -> bool {
    match std::process::Command::new(program).args(args).spawn() {
        Ok(_) => true,
        Err(error) => {
            warn!(program, error = %error, "failed to launch");
            false
        }
    }
}

/// Default implementation using the host's desktop tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl PlatformOps for SystemPlatform {
    fn open_file(&self, path: &Path) {
        let path = path.display().to_string();
        #[cfg(target_os = "macos")]
        spawn_detached("open", &[&path]);
        #[cfg(target_os = "windows")]
        spawn_detached("cmd", &["/C", "start", "", &path]);
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        spawn_detached("xdg-open", &[&path]);
    }

    fn reveal_in_folder(&self, path: &Path) {
        let abs = path.display().to_string();
        #[cfg(target_os = "macos")]
        {
            if path.exists() && spawn_detached("open", &["-R", &abs]) {
                return;
            }
        }
        #[cfg(target_os = "windows")]
        {
            if path.exists() && spawn_detached("explorer", &[&format!("/select,{abs}")]) {
                return;
            }
        }
        let _ = abs;
        if let Some(parent) = path.parent() {
            self.open_file(parent);
        }
    }

    fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> bool {
        let lower = archive.display().to_string().to_lowercase();
        let archive_str = archive.display().to_string();
        let dest_str = dest_dir.display().to_string();

        #[cfg(not(target_os = "windows"))]
        {
            if lower.ends_with(".zip") {
                return spawn_detached("unzip", &["-o", &archive_str, "-d", &dest_str]);
            }
            if lower.ends_with(".tar.gz")
                || lower.ends_with(".tgz")
                || lower.ends_with(".tar.xz")
                || lower.ends_with(".tar.bz2")
                || lower.ends_with(".tar")
            {
                return spawn_detached("tar", &["-xf", &archive_str, "-C", &dest_str]);
            }
        }
        let _ = (lower, archive_str, dest_str);
        false
    }

    fn run_script(&self, command: &str) {
        debug!(command, "running post-download script");
        #[cfg(target_os = "windows")]
        spawn_detached("cmd", &["/C", command]);
        #[cfg(not(target_os = "windows"))]
        spawn_detached("/bin/sh", &["-c", command]);
    }
}

/// Implementation that performs nothing, for headless and test use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlatform;

impl PlatformOps for NoopPlatform {
    fn open_file(&self, _path: &Path) {}
    fn reveal_in_folder(&self, _path: &Path) {}
    fn extract_archive(&self, _archive: &Path, _dest_dir: &Path) -> bool {
        false
    }
    fn run_script(&self, _command: &str) {}
}

/// Substitutes `{file}` and `{dir}` placeholders in a script template.
#[must_use]
pub fn substitute_script(template: &str, file: &Path, dir: &Path) -> String {
    template
        .replace("{file}", &file.display().to_string())
        .replace("{dir}", &dir.display().to_string())
}
