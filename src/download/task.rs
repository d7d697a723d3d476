//! Per-download state machine and transfer runner.
//!
//! A [`DownloaderTask`] owns everything one download needs: the mirror list,
//! resume validators, network options, the throttle window, and the runtime
//! state machine (Idle → Downloading → Paused/Finished/Canceled). The actual
//! I/O runs in spawned transfer tasks that report back through the manager's
//! mailbox; each `start()` bumps a generation counter and events stamped
//! with an older generation are dropped, so nothing observed after a pause,
//! cancel, or restart can touch state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{HeaderName, HeaderValue, COOKIE, IF_RANGE, RANGE};
use reqwest::redirect;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::constants::{
    LOG_LINE_LIMIT, MAX_SEGMENTS, MERGE_BUFFER_SIZE, SPEED_HISTORY_LIMIT,
    SPEED_HISTORY_SPACING_MS, SPEED_SAMPLE_INTERVAL, USER_AGENT,
};
use super::error::DownloadError;
use super::filename::{segment_part_path, single_part_path};
use super::segment::{Segment, effective_segment_count, plan_segments, remove_parts_beyond};
use super::throttle::{ThrottleWindow, write_throttled};
use crate::checksum::ChecksumState;
use crate::manager::events::{EngineEvent, TaskEvent};

/// Opaque handle identifying a task inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Downloading,
    Paused,
    Finished,
    Canceled,
}

/// Per-task HTTP proxy settings.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Network options applied to every request of a task.
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    /// Raw `Name: Value` lines; `Range` and `If-Range` are reserved and skipped.
    pub custom_headers: Vec<String>,
    /// Raw Cookie header value.
    pub cookie_header: String,
    pub auth_user: String,
    pub auth_password: String,
    pub proxy: ProxyConfig,
}

/// Actions performed after a successful download.
#[derive(Debug, Clone, Default)]
pub struct PostActions {
    pub open_file: bool,
    pub reveal_folder: bool,
    pub extract: bool,
    /// Shell template with `{file}` and `{dir}` placeholders.
    pub script: String,
}

/// Checksum configuration and verification progress.
#[derive(Debug, Clone, Default)]
pub struct ChecksumInfo {
    pub algorithm: String,
    pub expected: String,
    pub actual: String,
    pub state: ChecksumState,
}

/// Observable per-task statistics.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub speed: u64,
    pub eta_secs: i64,
    pub last_speed: u64,
    pub last_eta: i64,
    pub paused_at_ms: i64,
    pub pause_reason: String,
    pub speed_history: Vec<f64>,
    pub log_lines: Vec<String>,
    last_history_sample_ms: i64,
}

/// One download with its mirrors, options, and runtime state.
#[derive(Debug)]
pub struct DownloaderTask {
    id: TaskId,
    url: Url,
    mirror_urls: Vec<String>,
    mirror_index: usize,
    file_path: PathBuf,
    configured_segments: u32,
    state: TaskState,
    any_error: bool,
    total_size: u64,
    server_supports_range: bool,
    etag: Option<String>,
    last_modified: Option<String>,
    pub checksum: ChecksumInfo,
    pub verify_on_complete: bool,
    pub network: NetworkOptions,
    pub post_actions: PostActions,
    /// -1 means "inherit the manager default".
    pub retry_max: i32,
    /// -1 means "inherit the manager default".
    pub retry_delay_sec: i32,
    pub stats: TaskStats,
    resume_warning: String,
    throttle: ThrottleWindow,
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl DownloaderTask {
    pub(crate) fn new(
        id: TaskId,
        url: Url,
        file_path: PathBuf,
        segments: u32,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            id,
            url,
            mirror_urls: Vec::new(),
            mirror_index: 0,
            file_path,
            configured_segments: segments.clamp(1, MAX_SEGMENTS),
            state: TaskState::Idle,
            any_error: false,
            total_size: 0,
            server_supports_range: false,
            etag: None,
            last_modified: None,
            checksum: ChecksumInfo::default(),
            verify_on_complete: false,
            network: NetworkOptions::default(),
            post_actions: PostActions::default(),
            retry_max: -1,
            retry_delay_sec: -1,
            stats: TaskStats::default(),
            resume_warning: String::new(),
            throttle: ThrottleWindow::new(0),
            generation: 0,
            cancel: CancellationToken::new(),
            events,
        }
    }

    // ----- accessors -----

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Display state: distinguishes Done from Error within Finished.
    #[must_use]
    pub fn state_str(&self) -> &'static str {
        if self.any_error && self.state == TaskState::Finished {
            return "Error";
        }
        match self.state {
            TaskState::Idle => "Queued",
            TaskState::Downloading => "Active",
            TaskState::Paused => "Paused",
            TaskState::Finished => "Done",
            TaskState::Canceled => "Canceled",
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == TaskState::Idle
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Downloading
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[must_use]
    pub fn segments(&self) -> u32 {
        self.configured_segments
    }

    /// Whether the origin advertised byte-range support.
    #[must_use]
    pub fn server_supports_range(&self) -> bool {
        self.server_supports_range
    }

    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    #[must_use]
    pub fn resume_warning(&self) -> &str {
        &self.resume_warning
    }

    #[must_use]
    pub fn mirror_urls(&self) -> &[String] {
        &self.mirror_urls
    }

    #[must_use]
    pub fn mirror_index(&self) -> usize {
        self.mirror_index
    }

    /// The URL the next request will use: the active mirror, else the base URL.
    #[must_use]
    pub fn current_url(&self) -> String {
        self.mirror_urls
            .get(self.mirror_index)
            .cloned()
            .unwrap_or_else(|| self.url.to_string())
    }

    #[must_use]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    // ----- configuration -----

    pub(crate) fn set_file_path(&mut self, path: PathBuf) {
        self.file_path = path;
    }

    /// Replaces the mirror list; the first entry becomes the active URL.
    pub(crate) fn set_mirror_urls(&mut self, urls: Vec<String>) {
        self.mirror_urls = urls;
        self.mirror_index = 0;
        if let Some(first) = self.mirror_urls.first() {
            if let Ok(parsed) = Url::parse(first) {
                self.url = parsed;
            }
        }
    }

    pub(crate) fn set_mirror_index(&mut self, index: usize) {
        self.mirror_index = index.min(self.mirror_urls.len().saturating_sub(1));
        if let Some(active) = self.mirror_urls.get(self.mirror_index) {
            if let Ok(parsed) = Url::parse(active) {
                self.url = parsed;
            }
        }
    }

    /// Moves to the next mirror, clearing resume validators (partial content
    /// from the old origin cannot be validated against the new one).
    pub(crate) fn advance_mirror(&mut self) -> bool {
        if self.mirror_urls.is_empty() || self.mirror_index + 1 >= self.mirror_urls.len() {
            return false;
        }
        self.mirror_index += 1;
        if let Some(next) = self.mirror_urls.get(self.mirror_index) {
            if let Ok(parsed) = Url::parse(next) {
                self.url = parsed;
                self.etag = None;
                self.last_modified = None;
            }
        }
        true
    }

    pub(crate) fn set_checksum_expected(&mut self, value: String) {
        if value.is_empty() {
            self.checksum.state = ChecksumState::None;
            self.checksum.actual.clear();
        } else if self.checksum.state == ChecksumState::None {
            self.checksum.state = ChecksumState::Pending;
        }
        self.checksum.expected = value;
    }

    pub(crate) fn set_resume_info(&mut self, etag: Option<String>, last_modified: Option<String>) {
        self.etag = etag;
        self.last_modified = last_modified;
    }

    pub(crate) fn set_resume_warning(&mut self, warning: String) {
        self.resume_warning = warning;
    }

    pub(crate) fn set_max_speed(&mut self, bytes_per_sec: u64) {
        self.throttle.set_max_speed(bytes_per_sec);
    }

    #[must_use]
    pub fn max_speed(&self) -> u64 {
        self.throttle.max_speed()
    }

    pub(crate) fn apply_metadata(&mut self, total_size: u64, supports_range: bool) {
        self.total_size = total_size;
        self.server_supports_range = supports_range;
    }

    pub(crate) fn apply_validators(&mut self, etag: Option<String>, last_modified: Option<String>) {
        if etag.is_some() {
            self.etag = etag;
        }
        if last_modified.is_some() {
            self.last_modified = last_modified;
        }
    }

    /// Records a terminal outcome reported by the transfer runner.
    pub(crate) fn apply_finished(&mut self, success: bool) {
        if self.state != TaskState::Downloading {
            return;
        }
        self.any_error = !success;
        self.state = TaskState::Finished;
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
    }

    pub(crate) fn apply_speed_sample(&mut self, bytes_per_sec: u64, eta_secs: i64) {
        self.stats.speed = bytes_per_sec;
        self.stats.eta_secs = eta_secs;
        if bytes_per_sec > 0 {
            self.stats.last_speed = bytes_per_sec;
        }
        if eta_secs >= 0 {
            self.stats.last_eta = eta_secs;
        }
        let now_ms = Utc::now().timestamp_millis();
        if self.stats.last_history_sample_ms == 0
            || now_ms - self.stats.last_history_sample_ms >= SPEED_HISTORY_SPACING_MS
        {
            self.stats.last_history_sample_ms = now_ms;
            #[allow(clippy::cast_precision_loss)]
            self.stats.speed_history.push(bytes_per_sec as f64);
            while self.stats.speed_history.len() > SPEED_HISTORY_LIMIT {
                self.stats.speed_history.remove(0);
            }
        }
    }

    /// Appends a line to the bounded rolling log.
    pub(crate) fn append_log(&mut self, line: impl Into<String>) {
        let line = line.into();
        if line.trim().is_empty() {
            return;
        }
        self.stats.log_lines.push(line);
        while self.stats.log_lines.len() > LOG_LINE_LIMIT {
            self.stats.log_lines.remove(0);
        }
    }

    // ----- lifecycle -----

    /// Starts the transfer. Requires Idle; anything else is a no-op.
    ///
    /// Validation failures (unparsable active URL) finish the task with an
    /// error immediately; the Finished event still flows through the mailbox
    /// so retry and mirror handling run as for any other failure.
    pub(crate) fn start(&mut self) {
        if self.state != TaskState::Idle {
            return;
        }
        self.stats.pause_reason.clear();
        self.stats.paused_at_ms = 0;
        self.generation += 1;
        self.any_error = false;

        let active = self.current_url();
        let Ok(url) = Url::parse(&active) else {
            warn!(task = %self.id, url = %active, "invalid URL, failing task");
            self.append_log(DownloadError::invalid_url(active).to_string());
            self.any_error = true;
            self.state = TaskState::Finished;
            let _ = self.events.send(EngineEvent::Task {
                id: self.id,
                generation: self.generation,
                event: TaskEvent::Finished { success: false },
            });
            return;
        };

        debug!(task = %self.id, url = %url, "starting transfer");
        self.append_log(format!("Start: {url}"));
        self.state = TaskState::Downloading;
        self.cancel = CancellationToken::new();

        let ctx = TransferContext {
            id: self.id,
            generation: self.generation,
            url,
            file_path: self.file_path.clone(),
            configured_segments: self.configured_segments,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            network: self.network.clone(),
            throttle: self.throttle.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(run_transfer(ctx));
    }

    /// Pauses a running transfer. Safe to call repeatedly.
    ///
    /// Aborts all in-flight exchanges and discards in-memory transfer state;
    /// bytes already written stay on disk and are reconciled by the next
    /// start.
    pub(crate) fn pause(&mut self) {
        if self.state != TaskState::Downloading {
            return;
        }
        if self.stats.pause_reason.is_empty() {
            self.stats.pause_reason = "User".to_string();
        }
        self.state = TaskState::Paused;
        self.stats.paused_at_ms = Utc::now().timestamp_millis();
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.generation += 1;
        self.cancel.cancel();
        self.append_log("Paused");
    }

    pub(crate) fn pause_with_reason(&mut self, reason: &str) {
        if self.state != TaskState::Downloading {
            return;
        }
        self.stats.pause_reason = reason.to_string();
        self.pause();
    }

    /// Resumes a paused task as a cold start on the current on-disk state.
    pub(crate) fn resume(&mut self) {
        if self.state != TaskState::Paused {
            return;
        }
        self.append_log("Resumed");
        self.stats.pause_reason.clear();
        self.state = TaskState::Idle;
        self.start();
    }

    /// Cancels the task and removes its temp files. Terminal states are
    /// unaffected, and an already-finalized file is never deleted.
    pub(crate) fn cancel(&mut self) {
        if matches!(self.state, TaskState::Finished | TaskState::Canceled) {
            return;
        }
        self.append_log("Canceled");
        self.state = TaskState::Canceled;
        self.stats.pause_reason.clear();
        self.stats.paused_at_ms = 0;
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.generation += 1;
        self.cancel.cancel();
        self.remove_temp_files();
    }

    /// Cleans temp state and starts over from Idle.
    pub(crate) fn restart(&mut self) {
        self.append_log("Restart requested");
        self.generation += 1;
        self.cancel.cancel();
        self.remove_temp_files();
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.state = TaskState::Idle;
        self.start();
    }

    /// Removes all `.partN` siblings and the single-stream `.part` temp.
    fn remove_temp_files(&self) {
        for i in 0..self.configured_segments {
            let _ = std::fs::remove_file(segment_part_path(&self.file_path, i));
        }
        let _ = std::fs::remove_file(single_part_path(&self.file_path));
    }

    // ----- session-restore transitions (no Finished event) -----

    pub(crate) fn mark_paused(&mut self) {
        match self.state {
            TaskState::Paused | TaskState::Finished | TaskState::Canceled => {}
            TaskState::Downloading => self.pause(),
            TaskState::Idle => {
                self.state = TaskState::Paused;
                if self.stats.pause_reason.is_empty() {
                    self.stats.pause_reason = "User".to_string();
                }
                if self.stats.paused_at_ms == 0 {
                    self.stats.paused_at_ms = Utc::now().timestamp_millis();
                }
            }
        }
    }

    pub(crate) fn mark_error(&mut self) {
        if self.state == TaskState::Canceled {
            return;
        }
        self.any_error = true;
        self.state = TaskState::Finished;
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.stats.pause_reason.clear();
    }

    pub(crate) fn mark_done(&mut self) {
        if self.state == TaskState::Canceled {
            return;
        }
        self.any_error = false;
        self.state = TaskState::Finished;
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.stats.pause_reason.clear();
    }

    pub(crate) fn mark_canceled(&mut self) {
        if self.state == TaskState::Canceled {
            return;
        }
        self.state = TaskState::Canceled;
        self.stats.speed = 0;
        self.stats.eta_secs = -1;
        self.stats.pause_reason.clear();
    }

    /// Seeds persisted observable stats at session restore.
    pub(crate) fn seed_persisted_stats(
        &mut self,
        last_speed: u64,
        last_eta: i64,
        paused_at_ms: i64,
        pause_reason: String,
    ) {
        self.stats.last_speed = last_speed;
        self.stats.last_eta = last_eta.max(-1);
        self.stats.paused_at_ms = paused_at_ms.max(0);
        self.stats.pause_reason = pause_reason;
    }
}

// ===========================================================================
// Transfer runner
// ===========================================================================

/// Everything a transfer run needs, captured at start time.
struct TransferContext {
    id: TaskId,
    generation: u64,
    url: Url,
    file_path: PathBuf,
    configured_segments: u32,
    etag: Option<String>,
    last_modified: Option<String>,
    network: NetworkOptions,
    throttle: ThrottleWindow,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
}

impl TransferContext {
    fn send(&self, event: TaskEvent) {
        let _ = self.events.send(EngineEvent::Task {
            id: self.id,
            generation: self.generation,
            event,
        });
    }

    fn finish(&self, success: bool) {
        self.send(TaskEvent::Finished { success });
    }

    fn log(&self, line: impl Into<String>) {
        self.send(TaskEvent::LogLine(line.into()));
    }

    /// The If-Range value: ETag wins over Last-Modified.
    fn if_range_value(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Redirect policy that follows everything except HTTPS→HTTP downgrades.
fn no_less_safe_redirects() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        let was_https = attempt
            .previous()
            .last()
            .is_some_and(|u| u.scheme() == "https");
        if was_https && attempt.url().scheme() != "https" {
            attempt.stop()
        } else if attempt.previous().len() > 10 {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    })
}

fn build_client(network: &NetworkOptions) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(no_less_safe_redirects());
    if !network.proxy.host.is_empty() && network.proxy.port > 0 {
        let mut proxy =
            reqwest::Proxy::all(format!("http://{}:{}", network.proxy.host, network.proxy.port))?;
        if !network.proxy.user.is_empty() {
            proxy = proxy.basic_auth(&network.proxy.user, &network.proxy.password);
        }
        builder = builder.proxy(proxy);
    }
    builder.build()
}

/// Attaches cookie, basic-auth, and custom headers to a request.
///
/// Custom headers are `Name: Value` lines; empty names, malformed lines, and
/// the reserved `Range`/`If-Range` names are skipped.
fn apply_network_options(
    mut request: reqwest::RequestBuilder,
    network: &NetworkOptions,
) -> reqwest::RequestBuilder {
    if !network.cookie_header.is_empty() {
        request = request.header(COOKIE, &network.cookie_header);
    }
    if !network.auth_user.is_empty() {
        request = request.basic_auth(&network.auth_user, Some(&network.auth_password));
    }
    for line in &network.custom_headers {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty()
            || name.eq_ignore_ascii_case("range")
            || name.eq_ignore_ascii_case("if-range")
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        request = request.header(name, value);
    }
    request
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Shared progress accounting for one transfer run.
struct ProgressTracker {
    counters: Vec<AtomicU64>,
    total: u64,
    report: std::sync::Mutex<ReportState>,
}

struct ReportState {
    last_instant: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    fn new(initial: Vec<u64>, total: u64) -> Self {
        let received: u64 = initial.iter().sum();
        Self {
            counters: initial.into_iter().map(AtomicU64::new).collect(),
            total,
            report: std::sync::Mutex::new(ReportState {
                last_instant: Instant::now(),
                last_bytes: received,
            }),
        }
    }

    fn add(&self, index: usize, bytes: u64) {
        self.counters[index].fetch_add(bytes, Ordering::Relaxed);
    }

    fn received(&self) -> u64 {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Emits Progress and a speed/ETA sample at most twice per second.
    fn maybe_report(&self, ctx: &TransferContext) {
        let received = self.received();
        let Ok(mut state) = self.report.lock() else {
            return;
        };
        let elapsed = state.last_instant.elapsed();
        if elapsed < SPEED_SAMPLE_INTERVAL {
            return;
        }
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
        let delta = received.saturating_sub(state.last_bytes);
        let speed = delta.saturating_mul(1000) / elapsed_ms;
        state.last_instant = Instant::now();
        state.last_bytes = received;
        drop(state);

        ctx.send(TaskEvent::Progress {
            received,
            total: self.total,
        });
        let eta = if self.total > 0 && speed > 0 {
            i64::try_from((self.total.saturating_sub(received)) / speed).unwrap_or(i64::MAX)
        } else {
            -1
        };
        ctx.send(TaskEvent::SpeedSample {
            bytes_per_sec: speed,
            eta_secs: eta,
        });
    }

    /// Unconditional progress report (run start and completion).
    fn report_now(&self, ctx: &TransferContext) {
        ctx.send(TaskEvent::Progress {
            received: self.received(),
            total: self.total,
        });
    }
}

/// Entry point of one transfer run.
async fn run_transfer(ctx: TransferContext) {
    let client = match build_client(&ctx.network) {
        Ok(client) => client,
        Err(error) => {
            warn!(task = %ctx.id, error = %error, "failed to build HTTP client");
            ctx.log(format!("Client error: {error}"));
            ctx.finish(false);
            return;
        }
    };

    tokio::select! {
        () = ctx.cancel.cancelled() => {}
        () = dispatch_transfer(&ctx, &client) => {}
    }
}

/// Runs the HEAD probe and picks segmented or single-stream mode.
async fn dispatch_transfer(ctx: &TransferContext, client: &reqwest::Client) {
    let head = apply_network_options(client.head(ctx.url.clone()), &ctx.network)
        .send()
        .await;

    let response = match head {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!(task = %ctx.id, status = %response.status(), "HEAD failed, fallback to single stream");
            ctx.log("HEAD failed, fallback to single stream");
            run_single_stream(ctx, client, 0, true, true).await;
            return;
        }
        Err(error) => {
            debug!(task = %ctx.id, error = %error, "HEAD failed, fallback to single stream");
            ctx.log("HEAD failed, fallback to single stream");
            run_single_stream(ctx, client, 0, true, true).await;
            return;
        }
    };

    let etag = header_str(&response, "etag");
    let last_modified = header_str(&response, "last-modified");
    if etag.is_some() || last_modified.is_some() {
        ctx.send(TaskEvent::Validators {
            etag: etag.clone(),
            last_modified: last_modified.clone(),
        });
    }

    let content_length = header_str(&response, "content-length").and_then(|v| v.parse::<u64>().ok());
    let accepts_ranges = header_str(&response, "accept-ranges")
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    // Fold freshly observed validators into this run's If-Range source.
    let mut run_ctx = clone_context(ctx);
    if etag.is_some() {
        run_ctx.etag = etag;
    }
    if last_modified.is_some() {
        run_ctx.last_modified = last_modified;
    }
    let ctx = &run_ctx;

    let Some(total) = content_length.filter(|&v| v > 0) else {
        debug!(task = %ctx.id, "no Content-Length, single stream without resume");
        ctx.send(TaskEvent::Metadata {
            total_size: 0,
            supports_range: false,
        });
        run_single_stream(ctx, client, 0, false, false).await;
        return;
    };

    ctx.send(TaskEvent::Metadata {
        total_size: total,
        supports_range: accepts_ranges,
    });

    if !accepts_ranges || ctx.configured_segments == 1 {
        run_single_stream(ctx, client, total, accepts_ranges, accepts_ranges).await;
        return;
    }

    run_segmented(ctx, client, total).await;
}

fn clone_context(ctx: &TransferContext) -> TransferContext {
    TransferContext {
        id: ctx.id,
        generation: ctx.generation,
        url: ctx.url.clone(),
        file_path: ctx.file_path.clone(),
        configured_segments: ctx.configured_segments,
        etag: ctx.etag.clone(),
        last_modified: ctx.last_modified.clone(),
        network: ctx.network.clone(),
        throttle: ctx.throttle.clone(),
        events: ctx.events.clone(),
        cancel: ctx.cancel.clone(),
    }
}

/// Outcome of one segment fetch.
enum SegmentOutcome {
    Done,
    /// Server replied 200 to a partial-range request: ranges are not real.
    RangeIgnored,
    Failed,
    Canceled,
}

async fn run_segmented(ctx: &TransferContext, client: &reqwest::Client, total: u64) {
    let seg_count = effective_segment_count(total, ctx.configured_segments);
    let segments = plan_segments(&ctx.file_path, total, seg_count);
    remove_parts_beyond(&ctx.file_path, seg_count, ctx.configured_segments);

    let progress = Arc::new(ProgressTracker::new(
        segments.iter().map(|s| s.downloaded).collect(),
        total,
    ));
    progress.report_now(ctx);

    let segment_cancel = ctx.cancel.child_token();
    let mut join = JoinSet::new();
    let multi_segment = segments.len() > 1;

    for segment in segments.iter().filter(|s| !s.is_complete()).cloned() {
        let client = client.clone();
        let ctx_clone = clone_context(ctx);
        let progress = Arc::clone(&progress);
        let cancel = segment_cancel.clone();
        join.spawn(async move {
            fetch_segment(&ctx_clone, &client, segment, total, multi_segment, &progress, &cancel)
                .await
        });
    }

    if join.is_empty() {
        // Everything already on disk from a previous run; just merge.
        finalize_segmented(ctx, &segments).await;
        return;
    }

    let mut range_ignored = false;
    let mut any_error = false;
    while let Some(result) = join.join_next().await {
        match result {
            Ok(SegmentOutcome::Done) => {}
            Ok(SegmentOutcome::RangeIgnored) => {
                range_ignored = true;
                segment_cancel.cancel();
            }
            Ok(SegmentOutcome::Canceled) => {}
            Ok(SegmentOutcome::Failed) | Err(_) => {
                any_error = true;
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return;
    }

    if range_ignored {
        warn!(task = %ctx.id, "range ignored by server, switching to single stream");
        for segment in &segments {
            let _ = std::fs::remove_file(&segment.part_path);
        }
        ctx.send(TaskEvent::ResumeWarning(
            "Range ignored; switched to single stream".to_string(),
        ));
        ctx.log("Range ignored; switched to single stream");
        ctx.send(TaskEvent::Metadata {
            total_size: total,
            supports_range: false,
        });
        run_single_stream(ctx, client, total, false, false).await;
        return;
    }

    progress.report_now(ctx);

    let all_complete = segments
        .iter()
        .all(|s| part_len(&s.part_path) >= s.len());
    if any_error || !all_complete {
        ctx.finish(false);
        return;
    }

    finalize_segmented(ctx, &segments).await;
}

fn part_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

async fn finalize_segmented(ctx: &TransferContext, segments: &[Segment]) {
    match merge_segments(&ctx.file_path, segments).await {
        Ok(()) => ctx.finish(true),
        Err(error) => {
            warn!(task = %ctx.id, error = %error, "merge failed");
            ctx.log(format!("Merge failed: {error}"));
            ctx.finish(false);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_segment(
    ctx: &TransferContext,
    client: &reqwest::Client,
    segment: Segment,
    total: u64,
    multi_segment: bool,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> SegmentOutcome {
    let mut request = client.get(ctx.url.clone()).header(
        RANGE,
        format!("bytes={}-{}", segment.start + segment.downloaded, segment.end),
    );
    if segment.downloaded > 0 {
        if let Some(validator) = ctx.if_range_value() {
            request = request.header(IF_RANGE, validator);
        }
    }
    request = apply_network_options(request, &ctx.network);

    let response = tokio::select! {
        () = cancel.cancelled() => return SegmentOutcome::Canceled,
        result = request.send() => match result {
            Ok(response) => response,
            Err(error) => {
                let error = DownloadError::network(ctx.url.as_str(), error);
                warn!(task = %ctx.id, segment = segment.index, error = %error, "segment request failed");
                ctx.log(format!("Segment {}: {error}", segment.index));
                return SegmentOutcome::Failed;
            }
        },
    };

    let status = response.status().as_u16();
    let whole_file_range = segment.start == 0 && total > 0 && segment.end == total - 1;
    match status {
        206 => {}
        200 if !multi_segment || whole_file_range => {}
        200 => return SegmentOutcome::RangeIgnored,
        status if status >= 400 => {
            let error = DownloadError::http_status(ctx.url.as_str(), status);
            warn!(task = %ctx.id, segment = segment.index, status, "segment HTTP error");
            ctx.log(format!("Segment {}: {error}", segment.index));
            return SegmentOutcome::Failed;
        }
        _ => {}
    }

    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&segment.part_path)
        .await
    {
        Ok(file) => file,
        Err(error) => {
            warn!(task = %ctx.id, part = %segment.part_path.display(), error = %error, "cannot open part file");
            ctx.log(format!("Cannot open {}: {error}", segment.part_path.display()));
            return SegmentOutcome::Failed;
        }
    };

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return SegmentOutcome::Canceled,
            chunk = stream.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Err(error)) => {
                let error = DownloadError::network(ctx.url.as_str(), error);
                warn!(task = %ctx.id, segment = segment.index, error = %error, "segment stream error");
                ctx.log(format!("Segment {}: {error}", segment.index));
                return SegmentOutcome::Failed;
            }
            Some(Ok(chunk)) => {
                if let Err(error) = write_throttled(&mut file, &ctx.throttle, &chunk).await {
                    let error = DownloadError::io(segment.part_path.clone(), error);
                    warn!(task = %ctx.id, segment = segment.index, error = %error, "segment write error");
                    ctx.log(format!("Segment {}: {error}", segment.index));
                    return SegmentOutcome::Failed;
                }
                progress.add(segment.index as usize, chunk.len() as u64);
                progress.maybe_report(ctx);
            }
        }
    }

    if let Err(error) = file.flush().await {
        ctx.log(format!("Segment {} flush error: {error}", segment.index));
        return SegmentOutcome::Failed;
    }
    SegmentOutcome::Done
}

/// Stream-copies every part into the final file in order, then removes each
/// part once its bytes are safely in the output.
async fn merge_segments(file_path: &Path, segments: &[Segment]) -> Result<(), DownloadError> {
    let mut out = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    let mut buffer = vec![0u8; MERGE_BUFFER_SIZE];
    for segment in segments {
        let mut part = tokio::fs::File::open(&segment.part_path)
            .await
            .map_err(|e| DownloadError::io(segment.part_path.clone(), e))?;
        loop {
            let n = part
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io(segment.part_path.clone(), e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .await
                .map_err(|e| DownloadError::io(file_path, e))?;
        }
        let _ = tokio::fs::remove_file(&segment.part_path).await;
    }
    out.flush().await.map_err(|e| DownloadError::io(file_path, e))
}

/// Runs a single-stream transfer, optionally resuming from on-disk bytes.
///
/// The loop exists for the two downgrade paths: a rejected resume (4xx on
/// the ranged request) restarts from byte zero, and a 200 to a ranged
/// request truncates and continues with the same response.
async fn run_single_stream(
    ctx: &TransferContext,
    client: &reqwest::Client,
    total: u64,
    use_range: bool,
    allow_resume: bool,
) {
    let mut resume = allow_resume && use_range;

    loop {
        let temp_path = single_part_path(&ctx.file_path);
        let use_temp = temp_path.exists() || !ctx.file_path.exists();
        let write_path = if use_temp {
            temp_path
        } else {
            ctx.file_path.clone()
        };

        let existing = if resume { part_len(&write_path) } else { 0 };
        if existing == 0 {
            resume = false;
        }

        let mut request = client.get(ctx.url.clone());
        if resume {
            request = request.header(RANGE, format!("bytes={existing}-"));
            if let Some(validator) = ctx.if_range_value() {
                request = request.header(IF_RANGE, validator);
            }
        }
        request = apply_network_options(request, &ctx.network);

        let response = tokio::select! {
            () = ctx.cancel.cancelled() => return,
            result = request.send() => match result {
                Ok(response) => response,
                Err(error) => {
                    let error = DownloadError::network(ctx.url.as_str(), error);
                    warn!(task = %ctx.id, error = %error, "GET failed");
                    ctx.log(error.to_string());
                    ctx.finish(false);
                    return;
                }
            },
        };

        let status = response.status().as_u16();
        let etag = header_str(&response, "etag");
        let last_modified = header_str(&response, "last-modified");
        if etag.is_some() || last_modified.is_some() {
            ctx.send(TaskEvent::Validators { etag, last_modified });
        }
        if status == 206 || status == 200 {
            ctx.send(TaskEvent::Metadata {
                total_size: total,
                supports_range: status == 206,
            });
        }

        let mut truncate = true;
        if resume {
            if status >= 400 {
                // The origin rejected the ranged request outright.
                debug!(task = %ctx.id, status, "resume rejected, restarting from zero");
                ctx.send(TaskEvent::ResumeWarning("Resume rejected; restarting".to_string()));
                ctx.log("Resume rejected; restarting from 0");
                let _ = tokio::fs::File::create(&write_path).await;
                resume = false;
                continue;
            }
            if status == 206 {
                truncate = false;
            } else {
                // 200: full body follows, the partial bytes are invalid.
                debug!(task = %ctx.id, "resume not supported, restarting within response");
                ctx.send(TaskEvent::ResumeWarning(
                    "Resume not supported; restarted".to_string(),
                ));
                ctx.log("Resume not supported; restarted");
            }
        } else if status >= 400 {
            let error = DownloadError::http_status(ctx.url.as_str(), status);
            warn!(task = %ctx.id, status, "HTTP error");
            ctx.log(error.to_string());
            ctx.finish(false);
            return;
        }

        let open_result = if truncate {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&write_path)
                .await
        } else {
            OpenOptions::new().create(true).append(true).open(&write_path).await
        };
        let mut file = match open_result {
            Ok(file) => file,
            Err(error) => {
                warn!(task = %ctx.id, path = %write_path.display(), error = %error, "cannot open output file");
                ctx.log(format!("Cannot open {}: {error}", write_path.display()));
                ctx.finish(false);
                return;
            }
        };

        let progress = ProgressTracker::new(vec![if truncate { 0 } else { existing }], total);
        progress.report_now(ctx);

        let mut any_error = false;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = ctx.cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Err(error)) => {
                    let error = DownloadError::network(ctx.url.as_str(), error);
                    warn!(task = %ctx.id, error = %error, "stream error");
                    ctx.log(error.to_string());
                    any_error = true;
                    break;
                }
                Some(Ok(chunk)) => {
                    if let Err(error) = write_throttled(&mut file, &ctx.throttle, &chunk).await {
                        let error = DownloadError::io(write_path.clone(), error);
                        warn!(task = %ctx.id, error = %error, "write error");
                        ctx.log(error.to_string());
                        any_error = true;
                        break;
                    }
                    progress.add(0, chunk.len() as u64);
                    progress.maybe_report(ctx);
                }
            }
        }

        let _ = file.flush().await;
        drop(file);
        progress.report_now(ctx);

        if !any_error && use_temp && write_path != ctx.file_path {
            if ctx.file_path.exists() {
                if let Err(error) = tokio::fs::remove_file(&ctx.file_path).await {
                    ctx.log(format!("Cannot replace {}: {error}", ctx.file_path.display()));
                    any_error = true;
                }
            }
            if !any_error {
                if let Err(error) = tokio::fs::rename(&write_path, &ctx.file_path).await {
                    ctx.log(format!("Rename failed: {error}"));
                    any_error = true;
                }
            }
        }

        ctx.finish(!any_error);
        return;
    }
}
