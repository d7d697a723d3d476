//! Versioned session persistence.
//!
//! The whole engine state serializes into one JSON document. Writes are
//! debounced (400 ms after the last mutation) and atomic: the document is
//! written to a sibling temp file and renamed into place, so a crash never
//! leaves a torn session. Reads are forward compatible; unknown fields are
//! ignored and missing fields take defaults, and a file that fails to parse
//! is treated as an empty session.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Current session schema version. Bumped whenever a field changes meaning.
pub const SESSION_VERSION: u32 = 4;

/// Quiet period after the last mutation before the session hits disk.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(400);

/// Serialized form of one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueRecord {
    pub name: String,
    pub max_concurrent: usize,
    pub max_speed: u64,
    pub schedule_enabled: bool,
    pub start_minutes: u32,
    pub end_minutes: u32,
    pub quota_enabled: bool,
    pub quota_bytes: u64,
    pub downloaded_today: u64,
    /// ISO-8601 date of the last quota reset.
    pub last_reset_date: String,
}

impl Default for QueueRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent: 0,
            max_speed: 0,
            schedule_enabled: false,
            start_minutes: 0,
            end_minutes: 0,
            quota_enabled: false,
            quota_bytes: 0,
            downloaded_today: 0,
            last_reset_date: String::new(),
        }
    }
}

/// Serialized per-task proxy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRecord {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Serialized form of one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemRecord {
    pub url: String,
    pub file_path: String,
    pub segments: u32,
    pub queue_name: String,
    pub category: String,
    pub state: String,
    pub task_max_speed: u64,
    pub bytes_received: u64,
    pub bytes_total: u64,
    pub last_speed: u64,
    pub last_eta: i64,
    pub paused_at: i64,
    pub pause_reason: String,
    pub completed_at: i64,
    pub etag: String,
    pub last_modified: String,
    pub resume_warning: String,
    pub mirrors: Vec<String>,
    pub mirror_index: usize,
    pub checksum_algo: String,
    pub checksum_expected: String,
    pub checksum_actual: String,
    pub checksum_state: String,
    pub verify_on_complete: bool,
    pub post_open_file: bool,
    pub post_reveal_folder: bool,
    pub post_extract: bool,
    pub post_script: String,
    pub retry_max: i32,
    pub retry_delay_sec: i32,
    pub headers: Vec<String>,
    pub cookie_header: String,
    pub auth_user: String,
    pub auth_password: String,
    pub proxy: ProxyRecord,
}

impl Default for ItemRecord {
    fn default() -> Self {
        Self {
            url: String::new(),
            file_path: String::new(),
            segments: 8,
            queue_name: String::new(),
            category: String::new(),
            state: String::new(),
            task_max_speed: 0,
            bytes_received: 0,
            bytes_total: 0,
            last_speed: 0,
            last_eta: -1,
            paused_at: 0,
            pause_reason: String::new(),
            completed_at: 0,
            etag: String::new(),
            last_modified: String::new(),
            resume_warning: String::new(),
            mirrors: Vec::new(),
            mirror_index: 0,
            checksum_algo: String::new(),
            checksum_expected: String::new(),
            checksum_actual: String::new(),
            checksum_state: String::new(),
            verify_on_complete: false,
            post_open_file: false,
            post_reveal_folder: false,
            post_extract: false,
            post_script: String::new(),
            retry_max: -1,
            retry_delay_sec: -1,
            headers: Vec::new(),
            cookie_header: String::new(),
            auth_user: String::new(),
            auth_password: String::new(),
            proxy: ProxyRecord::default(),
        }
    }
}

/// The complete persisted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionData {
    pub version: u32,
    pub max_concurrent: usize,
    pub global_max_speed: u64,
    pub pause_on_battery: bool,
    pub resume_on_ac: bool,
    pub queues: Vec<QueueRecord>,
    pub category_folders: BTreeMap<String, String>,
    pub domain_rules: BTreeMap<String, String>,
    pub items: Vec<ItemRecord>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            version: SESSION_VERSION,
            max_concurrent: 3,
            global_max_speed: 0,
            pause_on_battery: false,
            resume_on_ac: true,
            queues: Vec::new(),
            category_folders: BTreeMap::new(),
            domain_rules: BTreeMap::new(),
            items: Vec::new(),
        }
    }
}

/// Debounced, atomic writer for the session document.
#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    deadline: Option<Instant>,
}

impl SessionStore {
    /// Creates a store. `None` disables persistence entirely.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            deadline: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Arms the debounce timer; a timer already running is left alone so a
    /// stream of mutations produces one write.
    pub fn schedule_save(&mut self) {
        if self.path.is_none() {
            return;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + SAVE_DEBOUNCE);
        }
    }

    /// The armed write deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Writes the session atomically: temp sibling first, then rename.
    pub async fn save(&mut self, data: &SessionData) -> std::io::Result<()> {
        self.deadline = None;
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, &json).await?;
        tokio::fs::rename(&temp, path).await?;
        debug!(path = %path.display(), items = data.items.len(), "session saved");
        Ok(())
    }

    /// Loads the session, treating anything unreadable as empty.
    pub async fn load(&self) -> Option<SessionData> {
        let path = self.path.as_ref()?;
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<SessionData>(&raw) {
            Ok(data) => Some(data),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "session unreadable, starting empty");
                None
            }
        }
    }
}
