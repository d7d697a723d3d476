//! The download manager: queues, admission, policies, retries, persistence.
//!
//! The manager is an actor. One tokio task owns every [`DownloaderTask`],
//! queue, and policy flag, and consumes a single mailbox fed by user
//! commands, transfer events, retry timers, and the checksum worker. The
//! scheduler tick, power poll, and debounced session save are `select!`
//! branches of the same loop, so no state is ever touched concurrently.
//!
//! # Admission
//!
//! After any event that may unblock work, tasks are scanned in insertion
//! order and started while the global limit, the per-queue limit, the queue
//! schedule/quota, and the battery policy all allow it.
//!
//! # Failure handling
//!
//! A task that finishes in error first advances to its next mirror (which
//! restarts it immediately), and only once mirrors are exhausted consults
//! the retry policy (task override, else manager defaults) to schedule a
//! delayed restart.

pub mod events;
pub mod listio;
pub mod queues;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::checksum::{self, ChecksumAlgorithm, ChecksumState};
use crate::download::category::detect_category;
use crate::download::constants::{DEFAULT_SEGMENTS, USER_AGENT};
use crate::download::filename::{
    bytes_received_on_disk, file_name_from_url, looks_like_guid_name, normalize_file_path,
    normalize_host, segment_part_path, single_part_path, unique_file_path,
};
use crate::download::task::{DownloaderTask, TaskId, TaskState};
use crate::model::{DownloadModel, ModelRow, SortField};
use crate::platform::{PlatformOps, substitute_script};
use crate::power::PowerSource;
use crate::session::{ItemRecord, ProxyRecord, QueueRecord, SessionData, SessionStore};
use events::{EngineEvent, Notice, Severity, TaskEvent};
use listio::{ExportItem, ImportEntry};
use queues::{DEFAULT_QUEUE_NAME, QueueInfo};

/// Default interval of the scheduler tick (policy enforcement plus
/// admission) and of the power-source poll.
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);

/// Static configuration handed to the manager at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Session file location; `None` disables persistence.
    pub session_path: Option<PathBuf>,
    /// Fallback folder for downloads without an explicit path.
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub global_max_speed: u64,
    pub auto_retry_max: u32,
    pub auto_retry_delay_secs: u64,
    pub pause_on_battery: bool,
    pub resume_on_ac: bool,
    /// Scheduler tick interval; shorten only in tests and embeddings.
    pub scheduler_interval: Duration,
    /// Power-source poll interval.
    pub power_poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_path: dirs::data_dir().map(|d| d.join("raad").join("downloads.json")),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent: 3,
            global_max_speed: 0,
            auto_retry_max: 3,
            auto_retry_delay_secs: 10,
            pause_on_battery: false,
            resume_on_ac: true,
            scheduler_interval: SCHEDULER_INTERVAL,
            power_poll_interval: SCHEDULER_INTERVAL,
        }
    }
}

/// Optional per-task settings accepted at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub mirrors: Vec<String>,
    pub checksum_algo: Option<String>,
    pub checksum_expected: Option<String>,
    pub verify_on_complete: Option<bool>,
    pub headers: Vec<String>,
    pub cookie_header: Option<String>,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub retry_max: Option<i32>,
    pub retry_delay_sec: Option<i32>,
    pub post_open_file: Option<bool>,
    pub post_reveal_folder: Option<bool>,
    pub post_extract: Option<bool>,
    pub post_script: Option<String>,
    pub segments: Option<u32>,
}

/// A new download to enqueue.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub file_path: Option<PathBuf>,
    pub queue: Option<String>,
    pub category: Option<String>,
    pub start_paused: bool,
    pub options: TaskOptions,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Aggregate byte totals across all tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub speed: u64,
    pub received: u64,
    pub total: u64,
}

/// Task counts by coarse state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
}

/// Point-in-time details of one task, for inspection and tests.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub state: String,
    pub url: String,
    pub file_path: PathBuf,
    pub received: u64,
    pub total: u64,
    pub queue_name: String,
    pub category: String,
    pub mirror_index: usize,
    pub resume_warning: String,
    pub checksum_state: ChecksumState,
    pub checksum_actual: String,
    pub pause_reason: String,
    pub retry_attempts: u32,
}

/// Commands accepted by the manager's mailbox.
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    Add(Box<DownloadRequest>, oneshot::Sender<Option<TaskId>>),
    Pause(TaskId),
    Resume(TaskId),
    Cancel(TaskId),
    Restart(TaskId),
    Remove(TaskId),
    PauseAll,
    ResumeAll,
    CancelAll,
    RetryFailed,
    ClearCompleted,
    SetMaxConcurrent(usize),
    SetGlobalMaxSpeed(u64),
    SetTaskMaxSpeed(TaskId, u64),
    SetTaskQueue(TaskId, String),
    SetTaskCategory(TaskId, String),
    SetPauseOnBattery(bool),
    SetResumeOnAc(bool),
    CreateQueue(String),
    RemoveQueue(String),
    RenameQueue(String, String),
    SetQueueMaxConcurrent(String, usize),
    SetQueueMaxSpeed(String, u64),
    SetQueueSchedule(String, bool, u32, u32),
    SetQueueQuota(String, bool, u64),
    SetDomainRule(String, String),
    RemoveDomainRule(String),
    SetCategoryFolder(String, String),
    Verify(TaskId),
    TestUrl(String),
    RenameTaskFile(TaskId, String, oneshot::Sender<bool>),
    MoveTaskFile(TaskId, PathBuf, oneshot::Sender<bool>),
    Import(PathBuf),
    Export(PathBuf),
    SortBy(SortField, bool),
    Snapshot(oneshot::Sender<Vec<ModelRow>>),
    GetCounts(oneshot::Sender<Counts>),
    GetTotals(oneshot::Sender<Totals>),
    GetTaskInfo(TaskId, oneshot::Sender<Option<TaskInfo>>),
    GetQueueNames(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<ManagerCommand>,
}

impl ManagerHandle {
    fn send(&self, command: ManagerCommand) {
        let _ = self.commands.send(command);
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
        fallback: T,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx));
        rx.await.unwrap_or(fallback)
    }

    /// Enqueues a download; returns its handle, or `None` for invalid input.
    pub async fn add_download(&self, request: DownloadRequest) -> Option<TaskId> {
        self.query(|tx| ManagerCommand::Add(Box::new(request), tx), None)
            .await
    }

    pub fn pause_task(&self, id: TaskId) {
        self.send(ManagerCommand::Pause(id));
    }

    pub fn resume_task(&self, id: TaskId) {
        self.send(ManagerCommand::Resume(id));
    }

    pub fn cancel_task(&self, id: TaskId) {
        self.send(ManagerCommand::Cancel(id));
    }

    pub fn restart_task(&self, id: TaskId) {
        self.send(ManagerCommand::Restart(id));
    }

    pub fn remove_task(&self, id: TaskId) {
        self.send(ManagerCommand::Remove(id));
    }

    pub fn pause_all(&self) {
        self.send(ManagerCommand::PauseAll);
    }

    pub fn resume_all(&self) {
        self.send(ManagerCommand::ResumeAll);
    }

    pub fn cancel_all(&self) {
        self.send(ManagerCommand::CancelAll);
    }

    pub fn retry_failed(&self) {
        self.send(ManagerCommand::RetryFailed);
    }

    pub fn clear_completed(&self) {
        self.send(ManagerCommand::ClearCompleted);
    }

    pub fn set_max_concurrent(&self, value: usize) {
        self.send(ManagerCommand::SetMaxConcurrent(value));
    }

    pub fn set_global_max_speed(&self, bytes_per_sec: u64) {
        self.send(ManagerCommand::SetGlobalMaxSpeed(bytes_per_sec));
    }

    pub fn set_task_max_speed(&self, id: TaskId, bytes_per_sec: u64) {
        self.send(ManagerCommand::SetTaskMaxSpeed(id, bytes_per_sec));
    }

    pub fn set_task_queue(&self, id: TaskId, queue: impl Into<String>) {
        self.send(ManagerCommand::SetTaskQueue(id, queue.into()));
    }

    pub fn set_task_category(&self, id: TaskId, category: impl Into<String>) {
        self.send(ManagerCommand::SetTaskCategory(id, category.into()));
    }

    pub fn set_pause_on_battery(&self, enabled: bool) {
        self.send(ManagerCommand::SetPauseOnBattery(enabled));
    }

    pub fn set_resume_on_ac(&self, enabled: bool) {
        self.send(ManagerCommand::SetResumeOnAc(enabled));
    }

    pub fn create_queue(&self, name: impl Into<String>) {
        self.send(ManagerCommand::CreateQueue(name.into()));
    }

    pub fn remove_queue(&self, name: impl Into<String>) {
        self.send(ManagerCommand::RemoveQueue(name.into()));
    }

    pub fn rename_queue(&self, old: impl Into<String>, new: impl Into<String>) {
        self.send(ManagerCommand::RenameQueue(old.into(), new.into()));
    }

    pub fn set_queue_max_concurrent(&self, name: impl Into<String>, value: usize) {
        self.send(ManagerCommand::SetQueueMaxConcurrent(name.into(), value));
    }

    pub fn set_queue_max_speed(&self, name: impl Into<String>, bytes_per_sec: u64) {
        self.send(ManagerCommand::SetQueueMaxSpeed(name.into(), bytes_per_sec));
    }

    pub fn set_queue_schedule(
        &self,
        name: impl Into<String>,
        enabled: bool,
        start_minutes: u32,
        end_minutes: u32,
    ) {
        self.send(ManagerCommand::SetQueueSchedule(
            name.into(),
            enabled,
            start_minutes,
            end_minutes,
        ));
    }

    pub fn set_queue_quota(&self, name: impl Into<String>, enabled: bool, quota_bytes: u64) {
        self.send(ManagerCommand::SetQueueQuota(name.into(), enabled, quota_bytes));
    }

    pub fn set_domain_rule(&self, host: impl Into<String>, queue: impl Into<String>) {
        self.send(ManagerCommand::SetDomainRule(host.into(), queue.into()));
    }

    pub fn remove_domain_rule(&self, host: impl Into<String>) {
        self.send(ManagerCommand::RemoveDomainRule(host.into()));
    }

    pub fn set_category_folder(&self, category: impl Into<String>, folder: impl Into<String>) {
        self.send(ManagerCommand::SetCategoryFolder(category.into(), folder.into()));
    }

    pub fn verify_task(&self, id: TaskId) {
        self.send(ManagerCommand::Verify(id));
    }

    pub fn test_url(&self, url: impl Into<String>) {
        self.send(ManagerCommand::TestUrl(url.into()));
    }

    pub async fn rename_task_file(&self, id: TaskId, new_name: impl Into<String>) -> bool {
        let new_name = new_name.into();
        self.query(|tx| ManagerCommand::RenameTaskFile(id, new_name, tx), false)
            .await
    }

    pub async fn move_task_file(&self, id: TaskId, new_path: PathBuf) -> bool {
        self.query(|tx| ManagerCommand::MoveTaskFile(id, new_path, tx), false)
            .await
    }

    pub fn import_list(&self, path: PathBuf) {
        self.send(ManagerCommand::Import(path));
    }

    pub fn export_list(&self, path: PathBuf) {
        self.send(ManagerCommand::Export(path));
    }

    pub fn sort_by(&self, field: SortField, ascending: bool) {
        self.send(ManagerCommand::SortBy(field, ascending));
    }

    /// Current rows of the download list, with live status strings.
    pub async fn snapshot(&self) -> Vec<ModelRow> {
        self.query(ManagerCommand::Snapshot, Vec::new()).await
    }

    pub async fn counts(&self) -> Counts {
        self.query(ManagerCommand::GetCounts, Counts::default()).await
    }

    pub async fn totals(&self) -> Totals {
        self.query(ManagerCommand::GetTotals, Totals::default()).await
    }

    pub async fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.query(|tx| ManagerCommand::GetTaskInfo(id, tx), None).await
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.query(ManagerCommand::GetQueueNames, Vec::new()).await
    }

    /// Flushes the session and stops the manager loop.
    pub async fn shutdown(&self) {
        self.query(ManagerCommand::Shutdown, ()).await;
    }
}

/// Everything the manager tracks for one task besides the task itself.
#[derive(Debug)]
struct TaskEntry {
    task: DownloaderTask,
    queue: String,
    category: String,
    received: u64,
    total: u64,
    last_received: u64,
    speed: u64,
    max_speed: u64,
    completed_at_ms: i64,
    retry_attempts: u32,
    paused_by_schedule: bool,
    paused_by_quota: bool,
    paused_by_battery: bool,
    checksum_running: bool,
}

impl TaskEntry {
    fn new(task: DownloaderTask, queue: String, category: String) -> Self {
        Self {
            task,
            queue,
            category,
            received: 0,
            total: 0,
            last_received: 0,
            speed: 0,
            max_speed: 0,
            completed_at_ms: 0,
            retry_attempts: 0,
            paused_by_schedule: false,
            paused_by_quota: false,
            paused_by_battery: false,
            checksum_running: false,
        }
    }
}

/// Effective speed cap: minimum of the global, queue, and task caps, where
/// 0 means "no limit" and is ignored.
fn effective_speed(global: u64, queue: u64, task: u64) -> u64 {
    let mut effective = global;
    for candidate in [queue, task] {
        if candidate > 0 && (effective == 0 || candidate < effective) {
            effective = candidate;
        }
    }
    effective
}

fn minutes_of_day() -> u32 {
    let now = Local::now().time();
    now.hour() * 60 + now.minute()
}

/// The manager actor. Constructed with [`DownloadManager::new`], then driven
/// to completion with [`DownloadManager::run`] on a tokio task.
pub struct DownloadManager {
    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    queues: HashMap<String, QueueInfo>,
    queue_order: Vec<String>,
    domain_rules: HashMap<String, String>,
    category_folders: HashMap<String, String>,
    model: DownloadModel,
    totals: Totals,
    max_concurrent: usize,
    global_max_speed: u64,
    auto_retry_max: u32,
    auto_retry_delay_secs: u64,
    pause_on_battery: bool,
    resume_on_ac: bool,
    on_battery: bool,
    bulk_cancel_in_progress: bool,
    restore_in_progress: bool,
    next_task_id: u64,
    download_dir: PathBuf,
    scheduler_interval: Duration,
    power_poll_interval: Duration,
    session: SessionStore,
    power: Arc<dyn PowerSource>,
    platform: Arc<dyn PlatformOps>,
    commands_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    notices_tx: mpsc::UnboundedSender<Notice>,
}

impl DownloadManager {
    /// Builds a manager with injected collaborators. Returns the handle used
    /// to talk to it, the actor itself (spawn [`Self::run`]), and the stream
    /// of user-facing notices.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        power: Arc<dyn PowerSource>,
        platform: Arc<dyn PlatformOps>,
    ) -> (ManagerHandle, Self, mpsc::UnboundedReceiver<Notice>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let manager = Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            queues: HashMap::new(),
            queue_order: Vec::new(),
            domain_rules: HashMap::new(),
            category_folders: HashMap::new(),
            model: DownloadModel::new(),
            totals: Totals::default(),
            max_concurrent: config.max_concurrent.max(1),
            global_max_speed: config.global_max_speed,
            auto_retry_max: config.auto_retry_max,
            auto_retry_delay_secs: config.auto_retry_delay_secs,
            pause_on_battery: config.pause_on_battery,
            resume_on_ac: config.resume_on_ac,
            on_battery: false,
            bulk_cancel_in_progress: false,
            restore_in_progress: false,
            next_task_id: 1,
            download_dir: config.download_dir,
            scheduler_interval: config.scheduler_interval,
            power_poll_interval: config.power_poll_interval,
            session: SessionStore::new(config.session_path),
            power,
            platform,
            commands_rx,
            events_rx,
            events_tx,
            notices_tx,
        };

        (ManagerHandle { commands: commands_tx }, manager, notices_rx)
    }

    /// Restores the session and runs the actor loop until shutdown.
    pub async fn run(mut self) {
        self.ensure_default_queue();
        self.load_session().await;
        self.update_power_state();
        self.scheduler_tick();

        let mut scheduler = tokio::time::interval(self.scheduler_interval);
        scheduler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut power_poll = tokio::time::interval(self.power_poll_interval);
        power_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Drain the immediate first ticks; startup already ran both.
        scheduler.tick().await;
        power_poll.tick().await;

        loop {
            let save_deadline = self.session.deadline();
            let save_timer = async move {
                match save_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(ManagerCommand::Shutdown(ack)) => {
                            self.flush_save().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.flush_save().await;
                            break;
                        }
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_engine_event(event),
                _ = scheduler.tick() => self.scheduler_tick(),
                _ = power_poll.tick() => self.update_power_state(),
                () = save_timer => self.flush_save().await,
            }
        }
        info!("download manager stopped");
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Add(request, ack) => {
                let id = self.add_download(*request);
                let _ = ack.send(id);
            }
            ManagerCommand::Pause(id) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.pause();
                    self.schedule_save();
                }
            }
            ManagerCommand::Resume(id) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.resume();
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::Cancel(id) => self.cancel_task(id),
            ManagerCommand::Restart(id) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.retry_attempts = 0;
                    entry.task.restart();
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::Remove(id) => self.remove_task(id),
            ManagerCommand::PauseAll => {
                for entry in self.tasks.values_mut() {
                    if entry.task.is_running() {
                        entry.task.pause();
                    }
                }
                self.schedule_save();
            }
            ManagerCommand::ResumeAll => {
                for entry in self.tasks.values_mut() {
                    if entry.task.state() == TaskState::Paused {
                        entry.task.resume();
                    }
                }
                self.start_queued();
                self.schedule_save();
            }
            ManagerCommand::CancelAll => self.cancel_all(),
            ManagerCommand::RetryFailed => {
                for entry in self.tasks.values_mut() {
                    if entry.task.state_str() == "Error" {
                        entry.retry_attempts = 0;
                        entry.task.restart();
                    }
                }
                self.start_queued();
                self.schedule_save();
            }
            ManagerCommand::ClearCompleted => self.clear_completed(),
            ManagerCommand::SetMaxConcurrent(value) => {
                let value = value.max(1);
                if self.max_concurrent != value {
                    self.max_concurrent = value;
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::SetGlobalMaxSpeed(value) => {
                if self.global_max_speed != value {
                    self.global_max_speed = value;
                    let ids: Vec<TaskId> = self.order.clone();
                    for id in ids {
                        self.apply_task_speed(id);
                    }
                    self.schedule_save();
                }
            }
            ManagerCommand::SetTaskMaxSpeed(id, value) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.max_speed = value;
                    self.apply_task_speed(id);
                    self.schedule_save();
                }
            }
            ManagerCommand::SetTaskQueue(id, name) => self.set_task_queue(id, &name),
            ManagerCommand::SetTaskCategory(id, category) => {
                self.set_task_category(id, &category);
            }
            ManagerCommand::SetPauseOnBattery(enabled) => {
                if self.pause_on_battery != enabled {
                    self.pause_on_battery = enabled;
                    self.update_power_state();
                    self.scheduler_tick();
                    self.schedule_save();
                }
            }
            ManagerCommand::SetResumeOnAc(enabled) => {
                if self.resume_on_ac != enabled {
                    self.resume_on_ac = enabled;
                    self.scheduler_tick();
                    self.schedule_save();
                }
            }
            ManagerCommand::CreateQueue(name) => {
                self.create_queue(&name);
            }
            ManagerCommand::RemoveQueue(name) => self.remove_queue(&name),
            ManagerCommand::RenameQueue(old, new) => self.rename_queue(&old, &new),
            ManagerCommand::SetQueueMaxConcurrent(name, value) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.max_concurrent = value.max(1);
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::SetQueueMaxSpeed(name, value) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.max_speed = value;
                    let ids: Vec<TaskId> = self
                        .order
                        .iter()
                        .copied()
                        .filter(|id| self.tasks.get(id).is_some_and(|e| e.queue == name))
                        .collect();
                    for id in ids {
                        self.apply_task_speed(id);
                    }
                    self.schedule_save();
                }
            }
            ManagerCommand::SetQueueSchedule(name, enabled, start, end) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.schedule_enabled = enabled;
                    queue.start_minutes = start.min(23 * 60 + 59);
                    queue.end_minutes = end.min(23 * 60 + 59);
                    self.enforce_queue_policies();
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::SetQueueQuota(name, enabled, quota_bytes) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.quota_enabled = enabled;
                    queue.quota_bytes = quota_bytes;
                    self.enforce_queue_policies();
                    self.start_queued();
                    self.schedule_save();
                }
            }
            ManagerCommand::SetDomainRule(host, queue) => {
                let host = normalize_host(&host);
                if !host.is_empty() {
                    let queue = if queue.is_empty() {
                        self.default_queue_name()
                    } else {
                        queue
                    };
                    if !self.queues.contains_key(&queue) {
                        self.create_queue(&queue);
                    }
                    self.domain_rules.insert(host, queue);
                    self.schedule_save();
                }
            }
            ManagerCommand::RemoveDomainRule(host) => {
                if self.domain_rules.remove(&normalize_host(&host)).is_some() {
                    self.schedule_save();
                }
            }
            ManagerCommand::SetCategoryFolder(category, folder) => {
                self.set_category_folder(&category, &folder);
            }
            ManagerCommand::Verify(id) => self.verify_checksum(id),
            ManagerCommand::TestUrl(url) => self.test_url(&url),
            ManagerCommand::RenameTaskFile(id, new_name, ack) => {
                let _ = ack.send(self.rename_task_file(id, &new_name));
            }
            ManagerCommand::MoveTaskFile(id, new_path, ack) => {
                let _ = ack.send(self.move_task_file(id, &new_path));
            }
            ManagerCommand::Import(path) => self.import_list(&path).await,
            ManagerCommand::Export(path) => self.export_list(&path).await,
            ManagerCommand::SortBy(field, ascending) => {
                let states: HashMap<TaskId, String> = self
                    .tasks
                    .iter()
                    .map(|(id, e)| (*id, e.task.state_str().to_string()))
                    .collect();
                self.model.sort_by(field, ascending, move |id| {
                    states.get(&id).cloned().unwrap_or_default()
                });
            }
            ManagerCommand::Snapshot(ack) => {
                let states: HashMap<TaskId, String> = self
                    .tasks
                    .iter()
                    .map(|(id, e)| (*id, e.task.state_str().to_string()))
                    .collect();
                let rows = self
                    .model
                    .snapshot(move |id| states.get(&id).cloned().unwrap_or_default());
                let _ = ack.send(rows);
            }
            ManagerCommand::GetCounts(ack) => {
                let _ = ack.send(self.counts());
            }
            ManagerCommand::GetTotals(ack) => {
                let _ = ack.send(self.totals);
            }
            ManagerCommand::GetTaskInfo(id, ack) => {
                let _ = ack.send(self.task_info(id));
            }
            ManagerCommand::GetQueueNames(ack) => {
                let _ = ack.send(self.queue_order.clone());
            }
            ManagerCommand::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    #[instrument(skip(self, request), fields(url = %request.url))]
    fn add_download(&mut self, request: DownloadRequest) -> Option<TaskId> {
        let Ok(url) = Url::parse(&request.url) else {
            warn!(url = %request.url, "rejecting invalid URL");
            self.notify("Invalid URL", Severity::Danger);
            return None;
        };

        // Queue: explicit name wins; otherwise domain rules may reroute away
        // from the default.
        let default_queue = self.default_queue_name();
        let mut queue_name = request
            .queue
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| default_queue.clone());
        let host = normalize_host(url.host_str().unwrap_or(""));
        if !host.is_empty() && queue_name == default_queue {
            if let Some(rule_queue) = self.domain_rules.get(&host) {
                queue_name = rule_queue.clone();
            }
        }
        if !self.queues.contains_key(&queue_name) {
            self.create_queue(&queue_name);
        }

        let mut path = request
            .file_path
            .map(|p| normalize_file_path(&p.display().to_string()))
            .unwrap_or_default();
        let mut category = match request.category.as_deref() {
            None | Some("" | "Auto") => {
                if path.as_os_str().is_empty() {
                    "Auto".to_string()
                } else {
                    detect_category(&path.display().to_string()).to_string()
                }
            }
            Some(category) => category.to_string(),
        };

        if path.as_os_str().is_empty() || path.is_dir() {
            let fallback = path.clone();
            path = self.resolve_download_path(&url, &category, &fallback);
        }
        if category == "Auto" && !path.as_os_str().is_empty() {
            category = detect_category(&path.display().to_string()).to_string();
        }

        // A GUID placeholder name loses to a nicer URL-derived name.
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            let nice = file_name_from_url(&url);
            if !nice.is_empty() && looks_like_guid_name(&name) {
                path = path.with_file_name(nice);
            }
        }

        // Category folder mapping rewrites the directory, keeping the name.
        if category != "Auto" {
            if let Some(folder) = self.category_folders.get(&category) {
                if let Some(name) = path.file_name() {
                    path = PathBuf::from(folder).join(name);
                }
            }
        }

        path = unique_file_path(&path);
        if let Some(parent) = path.parent() {
            if let Err(error) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %error, "cannot create download directory");
            }
        }

        let segments = request.options.segments.unwrap_or(DEFAULT_SEGMENTS);
        let id = self.create_task(url, path, queue_name, category, segments);
        self.apply_task_options(id, &request.options);
        if request.start_paused {
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.task.mark_paused();
            }
        }
        self.start_queued();
        self.schedule_save();
        Some(id)
    }

    fn create_task(
        &mut self,
        url: Url,
        file_path: PathBuf,
        queue_name: String,
        category: String,
        segments: u32,
    ) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let task = DownloaderTask::new(id, url, file_path.clone(), segments, self.events_tx.clone());
        debug!(task = %id, path = %file_path.display(), queue = %queue_name, "task created");

        self.model.add(id, &file_path, &queue_name, &category);
        self.tasks
            .insert(id, TaskEntry::new(task, queue_name, category));
        self.order.push(id);
        self.apply_task_speed(id);
        id
    }

    fn apply_task_options(&mut self, id: TaskId, options: &TaskOptions) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        let task = &mut entry.task;

        let mut mirrors = options.mirrors.clone();
        let base = task.current_url();
        if !mirrors.is_empty() {
            if !mirrors.contains(&base) {
                mirrors.insert(0, base);
            }
            task.set_mirror_urls(mirrors);
        }

        if let Some(algo) = &options.checksum_algo {
            task.checksum.algorithm.clone_from(algo);
        }
        if let Some(expected) = &options.checksum_expected {
            task.set_checksum_expected(expected.clone());
        }
        if let Some(verify) = options.verify_on_complete {
            task.verify_on_complete = verify;
        }
        if !options.headers.is_empty() {
            task.network.custom_headers.clone_from(&options.headers);
        }
        if let Some(cookie) = &options.cookie_header {
            task.network.cookie_header.clone_from(cookie);
        }
        if let Some(user) = &options.auth_user {
            task.network.auth_user.clone_from(user);
        }
        if let Some(password) = &options.auth_password {
            task.network.auth_password.clone_from(password);
        }
        if let Some(host) = &options.proxy_host {
            task.network.proxy.host.clone_from(host);
        }
        if let Some(port) = options.proxy_port {
            task.network.proxy.port = port;
        }
        if let Some(user) = &options.proxy_user {
            task.network.proxy.user.clone_from(user);
        }
        if let Some(password) = &options.proxy_password {
            task.network.proxy.password.clone_from(password);
        }
        if let Some(retry_max) = options.retry_max {
            task.retry_max = retry_max;
        }
        if let Some(retry_delay) = options.retry_delay_sec {
            task.retry_delay_sec = retry_delay;
        }
        if let Some(open) = options.post_open_file {
            task.post_actions.open_file = open;
        }
        if let Some(reveal) = options.post_reveal_folder {
            task.post_actions.reveal_folder = reveal;
        }
        if let Some(extract) = options.post_extract {
            task.post_actions.extract = extract;
        }
        if let Some(script) = &options.post_script {
            task.post_actions.script.clone_from(script);
        }
    }

    /// Picks the target path for a URL without an explicit one: URL-derived
    /// filename inside the category folder, the caller's fallback folder, or
    /// the default download directory.
    fn resolve_download_path(&self, url: &Url, category: &str, fallback_folder: &Path) -> PathBuf {
        let mut name = file_name_from_url(url);
        if name.is_empty() {
            name = "download.bin".to_string();
        }
        let effective_category = if category.is_empty() || category == "Auto" {
            detect_category(&name).to_string()
        } else {
            category.to_string()
        };
        let folder = self
            .category_folders
            .get(&effective_category)
            .map(PathBuf::from)
            .or_else(|| {
                (!fallback_folder.as_os_str().is_empty()).then(|| fallback_folder.to_path_buf())
            })
            .unwrap_or_else(|| self.download_dir.clone());
        folder.join(name)
    }

    // ------------------------------------------------------------------
    // Admission and policies
    // ------------------------------------------------------------------

    /// Starts idle tasks in insertion order while limits and policies allow.
    fn start_queued(&mut self) {
        if self.restore_in_progress {
            return;
        }
        let mut running = 0usize;
        let mut running_per_queue: HashMap<String, usize> = HashMap::new();
        for entry in self.tasks.values() {
            if entry.task.is_running() {
                running += 1;
                *running_per_queue.entry(entry.queue.clone()).or_default() += 1;
            }
        }

        let block_battery = self.pause_on_battery && self.on_battery;
        let now_minutes = minutes_of_day();
        let order = self.order.clone();

        for id in order {
            if running >= self.max_concurrent {
                break;
            }
            let Some(entry) = self.tasks.get(&id) else {
                continue;
            };
            if !entry.task.is_idle() || block_battery {
                continue;
            }
            let queue_name = entry.queue.clone();
            if !self.queues.contains_key(&queue_name) {
                self.create_queue(&queue_name);
            }
            let Some(queue) = self.queues.get(&queue_name) else {
                continue;
            };
            if !queue.is_allowed(now_minutes) {
                continue;
            }
            let queue_limit = if queue.max_concurrent > 0 {
                queue.max_concurrent
            } else {
                self.max_concurrent
            };
            if running_per_queue.get(&queue_name).copied().unwrap_or(0) >= queue_limit {
                continue;
            }

            self.apply_task_speed(id);
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.task.start();
            }
            running += 1;
            *running_per_queue.entry(queue_name).or_default() += 1;
        }
    }

    /// Applies the min-of-limits speed cap to one task.
    fn apply_task_speed(&mut self, id: TaskId) {
        let Some(entry) = self.tasks.get(&id) else {
            return;
        };
        let queue_speed = self
            .queues
            .get(&entry.queue)
            .map_or(0, |queue| queue.max_speed);
        let effective = effective_speed(self.global_max_speed, queue_speed, entry.max_speed);
        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.task.set_max_speed(effective);
        }
    }

    /// Pauses running tasks that violate battery/schedule/quota policy and
    /// auto-resumes policy-paused tasks whose reasons have cleared.
    fn enforce_queue_policies(&mut self) {
        let today = Local::now().date_naive();
        let now_minutes = minutes_of_day();
        let block_battery = self.pause_on_battery && self.on_battery;

        for queue in self.queues.values_mut() {
            queue.reset_quota_if_new_day(today);
        }

        // Policy snapshot per queue, to keep the task walk borrow-free.
        let policy: HashMap<String, (bool, bool, bool)> = self
            .queues
            .iter()
            .map(|(name, queue)| {
                (
                    name.clone(),
                    (
                        queue.is_allowed(now_minutes),
                        !queue.is_within_schedule(now_minutes),
                        queue.quota_exceeded(),
                    ),
                )
            })
            .collect();

        let mut changed = false;
        let order = self.order.clone();
        for id in order {
            let Some(entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            let Some(&(allowed, schedule_blocked, quota_blocked)) = policy.get(&entry.queue) else {
                continue;
            };

            if entry.task.is_running() {
                if block_battery {
                    entry.task.pause_with_reason("Battery");
                    entry.paused_by_battery = true;
                    changed = true;
                } else if !allowed {
                    if schedule_blocked {
                        entry.task.pause_with_reason("Schedule");
                    } else if quota_blocked {
                        entry.task.pause_with_reason("Quota");
                    } else {
                        entry.task.pause();
                    }
                    if schedule_blocked {
                        entry.paused_by_schedule = true;
                    }
                    if quota_blocked {
                        entry.paused_by_quota = true;
                    }
                    changed = true;
                }
            }

            if entry.task.state() == TaskState::Paused {
                let auto_paused =
                    entry.paused_by_schedule || entry.paused_by_quota || entry.paused_by_battery;
                let can_resume =
                    allowed && !block_battery && (self.resume_on_ac || !entry.paused_by_battery);
                if auto_paused && can_resume {
                    entry.paused_by_schedule = false;
                    entry.paused_by_quota = false;
                    entry.paused_by_battery = false;
                    entry.task.resume();
                    changed = true;
                }
            }
        }

        if changed {
            self.schedule_save();
        }
    }

    /// Fixed-interval tick: enforcement then admission.
    fn scheduler_tick(&mut self) {
        self.enforce_queue_policies();
        self.start_queued();
    }

    fn update_power_state(&mut self) {
        let next = self.power.is_on_battery(self.on_battery);
        if self.on_battery != next {
            info!(on_battery = next, "power source changed");
            self.on_battery = next;
            self.scheduler_tick();
        }
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Task {
                id,
                generation,
                event,
            } => {
                // Stale events belong to an aborted run.
                let Some(entry) = self.tasks.get(&id) else {
                    return;
                };
                if entry.task.generation() != generation {
                    return;
                }
                self.handle_task_event(id, event);
            }
            EngineEvent::RetryDue { id } => {
                let should_restart = self
                    .tasks
                    .get(&id)
                    .is_some_and(|entry| entry.task.state_str() == "Error");
                if should_restart {
                    if let Some(entry) = self.tasks.get_mut(&id) {
                        entry.task.restart();
                    }
                    self.start_queued();
                }
            }
            EngineEvent::ChecksumDone { id, digest } => self.on_checksum_done(id, digest),
        }
    }

    fn handle_task_event(&mut self, id: TaskId, event: TaskEvent) {
        match event {
            TaskEvent::Metadata {
                total_size,
                supports_range,
            } => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.apply_metadata(total_size, supports_range);
                    if total_size > 0 {
                        entry.total = total_size;
                        let received = entry.received;
                        self.model.update_progress(id, received, total_size);
                    }
                }
                self.update_totals();
                self.schedule_save();
            }
            TaskEvent::Validators {
                etag,
                last_modified,
            } => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.apply_validators(etag, last_modified);
                }
                self.schedule_save();
            }
            TaskEvent::Progress { received, total } => self.on_task_progress(id, received, total),
            TaskEvent::SpeedSample {
                bytes_per_sec,
                eta_secs,
            } => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.apply_speed_sample(bytes_per_sec, eta_secs);
                    entry.speed = bytes_per_sec;
                }
                self.update_totals();
            }
            TaskEvent::ResumeWarning(warning) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.set_resume_warning(warning.clone());
                }
                self.notify(warning, Severity::Warning);
                self.schedule_save();
            }
            TaskEvent::LogLine(line) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.append_log(line);
                }
            }
            TaskEvent::Finished { success } => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.task.apply_finished(success);
                }
                self.on_task_finished(id);
            }
        }
    }

    fn on_task_progress(&mut self, id: TaskId, received: u64, total: u64) {
        let queue_name;
        let delta;
        {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            delta = received.saturating_sub(entry.last_received);
            entry.last_received = received;
            entry.received = received;
            if total > 0 {
                entry.total = total;
            }
            queue_name = entry.queue.clone();
            let entry_total = entry.total;
            self.model.update_progress(id, received, entry_total);
        }

        let mut quota_tripped = false;
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.downloaded_today += delta;
            quota_tripped = queue.quota_exceeded();
        }
        if quota_tripped {
            self.enforce_queue_policies();
        }
        self.update_totals();
    }

    fn on_task_finished(&mut self, id: TaskId) {
        if self.bulk_cancel_in_progress {
            // cancel_all() clears the containers in one shot.
            return;
        }

        let state;
        let display_name;
        let wants_verify;
        {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            entry.speed = 0;
            entry.completed_at_ms = Utc::now().timestamp_millis();
            state = entry.task.state_str().to_string();
            display_name = entry
                .task
                .file_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            wants_verify =
                entry.task.verify_on_complete || !entry.task.checksum.expected.is_empty();
        }

        self.model.set_finished(id, true);

        match state.as_str() {
            "Done" => {
                info!(task = %id, "download finished");
                self.notify(format!("Download finished: {display_name}"), Severity::Success);
                self.apply_post_actions(id);
                if wants_verify {
                    self.verify_checksum(id);
                }
            }
            "Error" => {
                self.notify(format!("Download failed: {display_name}"), Severity::Danger);
                self.handle_retry_or_mirror(id, &display_name);
            }
            _ => {}
        }

        self.update_totals();
        self.schedule_save();
        self.start_queued();
    }

    /// Mirror failover first; retry with delay once mirrors are exhausted.
    fn handle_retry_or_mirror(&mut self, id: TaskId, display_name: &str) {
        enum Action {
            MirrorSwitched(String),
            RetryScheduled(u64),
            GiveUp,
        }

        let action = {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            if entry.task.advance_mirror() {
                // A fresh origin gets a fresh attempt budget.
                entry.retry_attempts = 0;
                let url = entry.task.current_url();
                entry.task.restart();
                Action::MirrorSwitched(url)
            } else {
                let max_retries = if entry.task.retry_max >= 0 {
                    u32::try_from(entry.task.retry_max).unwrap_or(0)
                } else {
                    self.auto_retry_max
                };
                let delay_secs = if entry.task.retry_delay_sec >= 0 {
                    u64::try_from(entry.task.retry_delay_sec).unwrap_or(0)
                } else {
                    self.auto_retry_delay_secs
                };
                if entry.retry_attempts < max_retries {
                    entry.retry_attempts += 1;
                    Action::RetryScheduled(delay_secs)
                } else {
                    Action::GiveUp
                }
            }
        };

        match action {
            Action::MirrorSwitched(url) => {
                info!(task = %id, url = %url, "switching mirror");
                self.notify(format!("Switching mirror: {url}"), Severity::Warning);
                self.start_queued();
            }
            Action::RetryScheduled(delay_secs) => {
                info!(task = %id, delay_secs, "retry scheduled");
                self.notify(
                    format!("Retrying in {delay_secs}s: {display_name}"),
                    Severity::Warning,
                );
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                    let _ = events.send(EngineEvent::RetryDue { id });
                });
            }
            Action::GiveUp => {
                debug!(task = %id, "retries exhausted");
            }
        }
    }

    // ------------------------------------------------------------------
    // Post-completion
    // ------------------------------------------------------------------

    fn apply_post_actions(&mut self, id: TaskId) {
        let Some(entry) = self.tasks.get(&id) else {
            return;
        };
        let path = entry.task.file_path().to_path_buf();
        if !path.is_file() {
            return;
        }
        let actions = entry.task.post_actions.clone();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut log_lines = Vec::new();

        if actions.reveal_folder {
            self.platform.reveal_in_folder(&path);
            log_lines.push("Post action: Reveal in folder".to_string());
        }
        if actions.open_file {
            self.platform.open_file(&path);
            log_lines.push("Post action: Open file".to_string());
        }
        if actions.extract {
            if self.platform.extract_archive(&path, &dir) {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.notify(format!("Extracting: {name}"), Severity::Info);
                log_lines.push("Post action: Extract".to_string());
            } else {
                self.notify("Extract failed (tool missing?)", Severity::Warning);
            }
        }
        let script = actions.script.trim();
        if !script.is_empty() {
            let resolved = substitute_script(script, &path, &dir);
            self.platform.run_script(&resolved);
            log_lines.push("Post action: Script".to_string());
        }

        if let Some(entry) = self.tasks.get_mut(&id) {
            for line in log_lines {
                entry.task.append_log(line);
            }
        }
    }

    fn verify_checksum(&mut self, id: TaskId) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        let path = entry.task.file_path().to_path_buf();
        if !path.is_file() {
            self.notify("File not found for checksum", Severity::Danger);
            return;
        }

        let expected = entry.task.checksum.expected.trim().to_string();
        let mut algo_name = entry.task.checksum.algorithm.trim().to_string();
        if algo_name.is_empty() {
            algo_name = ChecksumAlgorithm::detect(&expected)
                .map_or_else(|| "SHA256".to_string(), |a| a.as_str().to_string());
            entry.task.checksum.algorithm.clone_from(&algo_name);
        }
        let Some(algorithm) = ChecksumAlgorithm::parse(&algo_name) else {
            entry.task.checksum.state = ChecksumState::Unknown;
            self.notify("Unknown checksum algorithm", Severity::Warning);
            return;
        };

        if entry.checksum_running {
            self.notify("Checksum already running", Severity::Warning);
            return;
        }
        entry.checksum_running = true;
        entry.task.checksum.state = ChecksumState::Verifying;
        entry
            .task
            .append_log(format!("Checksum verify started ({})", algorithm.as_str()));

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let digest = tokio::task::spawn_blocking(move || {
                checksum::hash_file_sync(&path, algorithm).ok()
            })
            .await
            .ok()
            .flatten();
            let _ = events.send(EngineEvent::ChecksumDone { id, digest });
        });
    }

    fn on_checksum_done(&mut self, id: TaskId, digest: Option<String>) {
        let notice = {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            entry.checksum_running = false;
            match digest {
                None => {
                    entry.task.checksum.state = ChecksumState::Failed;
                    entry.task.append_log("Checksum failed");
                    ("Checksum failed".to_string(), Severity::Danger)
                }
                Some(actual) => {
                    entry.task.checksum.actual.clone_from(&actual);
                    let expected = entry.task.checksum.expected.trim();
                    if expected.is_empty() {
                        entry.task.checksum.state = ChecksumState::Computed;
                        entry.task.append_log("Checksum computed");
                        ("Checksum computed".to_string(), Severity::Info)
                    } else if checksum::normalize_checksum(expected)
                        == checksum::normalize_checksum(&actual)
                    {
                        entry.task.checksum.state = ChecksumState::Ok;
                        entry.task.append_log("Checksum OK");
                        ("Checksum OK".to_string(), Severity::Success)
                    } else {
                        entry.task.checksum.state = ChecksumState::Mismatch;
                        entry.task.append_log("Checksum mismatch");
                        ("Checksum mismatch".to_string(), Severity::Danger)
                    }
                }
            }
        };
        self.notify(notice.0, notice.1);
        self.schedule_save();
    }

    // ------------------------------------------------------------------
    // Task collection maintenance
    // ------------------------------------------------------------------

    fn cancel_task(&mut self, id: TaskId) {
        let display_name = {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            if matches!(entry.task.state(), TaskState::Finished | TaskState::Canceled) {
                return;
            }
            entry.task.cancel();
            entry.speed = 0;
            entry.completed_at_ms = Utc::now().timestamp_millis();
            entry
                .task
                .file_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        self.model.set_finished(id, true);
        self.notify(format!("Download canceled: {display_name}"), Severity::Muted);
        self.update_totals();
        self.schedule_save();
        self.start_queued();
    }

    fn remove_task(&mut self, id: TaskId) {
        if let Some(mut entry) = self.tasks.remove(&id) {
            entry.task.cancel();
        }
        self.order.retain(|other| *other != id);
        self.model.remove(id);
        self.update_totals();
        self.schedule_save();
        self.start_queued();
    }

    fn clear_completed(&mut self) {
        for id in self.model.finished_ids() {
            self.tasks.remove(&id);
            self.order.retain(|other| *other != id);
            self.model.remove(id);
        }
        self.update_totals();
        self.schedule_save();
        self.start_queued();
    }

    /// Cancels every task in one shot. The guard keeps per-task finished
    /// handling from re-entering container bookkeeping mid-iteration; rows
    /// stay visible in their Canceled state and totals drop to zero.
    fn cancel_all(&mut self) {
        self.bulk_cancel_in_progress = true;
        for (id, entry) in &mut self.tasks {
            let was_terminal =
                matches!(entry.task.state(), TaskState::Finished | TaskState::Canceled);
            entry.task.cancel();
            entry.speed = 0;
            entry.received = 0;
            entry.last_received = 0;
            entry.total = 0;
            self.model.update_progress(*id, 0, 0);
            if !was_terminal {
                self.model.set_finished(*id, true);
            }
        }
        self.bulk_cancel_in_progress = false;
        self.update_totals();
        self.schedule_save();
    }

    fn set_task_queue(&mut self, id: TaskId, name: &str) {
        let resolved = if name.is_empty() {
            self.default_queue_name()
        } else {
            name.to_string()
        };
        if !self.queues.contains_key(&resolved) {
            self.create_queue(&resolved);
        }
        let category = {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            entry.queue.clone_from(&resolved);
            entry.category.clone()
        };
        self.model.update_metadata(id, &resolved, &category);
        self.apply_task_speed(id);
        self.schedule_save();
        self.start_queued();
    }

    fn set_task_category(&mut self, id: TaskId, category: &str) {
        let (resolved, queue) = {
            let Some(entry) = self.tasks.get_mut(&id) else {
                return;
            };
            let resolved = if category.is_empty() {
                detect_category(&entry.task.file_path().display().to_string()).to_string()
            } else {
                category.to_string()
            };
            if entry.category == resolved {
                return;
            }
            entry.category.clone_from(&resolved);
            (resolved, entry.queue.clone())
        };
        self.model.update_metadata(id, &queue, &resolved);
        self.schedule_save();
    }

    fn rename_task_file(&mut self, id: TaskId, new_name: &str) -> bool {
        let trimmed = new_name.trim();
        if trimmed.is_empty() {
            return false;
        }
        let Some(entry) = self.tasks.get(&id) else {
            return false;
        };
        let new_path = entry
            .task
            .file_path()
            .parent()
            .map(|dir| dir.join(trimmed))
            .unwrap_or_else(|| PathBuf::from(trimmed));
        self.move_task_file(id, &new_path)
    }

    fn move_task_file(&mut self, id: TaskId, new_path: &Path) -> bool {
        let (old_path, segments) = {
            let Some(entry) = self.tasks.get(&id) else {
                return false;
            };
            if entry.task.state_str() == "Active" {
                return false;
            }
            (entry.task.file_path().to_path_buf(), entry.task.segments())
        };

        let normalized = normalize_file_path(&new_path.display().to_string());
        if normalized.as_os_str().is_empty() {
            return false;
        }
        let final_path = unique_file_path(&normalized);
        if let Some(parent) = final_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if !rename_task_files_on_disk(&old_path, &final_path, segments) {
            return false;
        }

        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.task.set_file_path(final_path.clone());
        }
        self.model.update_file_name(id, &final_path);
        self.schedule_save();
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.notify(format!("Moved to: {name}"), Severity::Info);
        true
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    fn default_queue_name(&self) -> String {
        self.queue_order
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string())
    }

    fn ensure_default_queue(&mut self) {
        if self.queue_order.is_empty() {
            let info = QueueInfo::new(
                DEFAULT_QUEUE_NAME,
                self.max_concurrent,
                Local::now().date_naive(),
            );
            self.queues.insert(info.name.clone(), info);
            self.queue_order.push(DEFAULT_QUEUE_NAME.to_string());
        }
    }

    fn create_queue(&mut self, name: &str) {
        let trimmed = name.trim();
        if trimmed.is_empty() || self.queues.contains_key(trimmed) {
            return;
        }
        debug!(queue = trimmed, "creating queue");
        let info = QueueInfo::new(trimmed, self.max_concurrent, Local::now().date_naive());
        self.queues.insert(trimmed.to_string(), info);
        self.queue_order.push(trimmed.to_string());
        self.schedule_save();
    }

    fn remove_queue(&mut self, name: &str) {
        if !self.queues.contains_key(name) || name == self.default_queue_name() {
            return;
        }
        let fallback = self.default_queue_name();
        let reassigned: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).is_some_and(|e| e.queue == name))
            .collect();
        for id in &reassigned {
            if let Some(entry) = self.tasks.get_mut(id) {
                entry.queue.clone_from(&fallback);
                let category = entry.category.clone();
                self.model.update_metadata(*id, &fallback, &category);
            }
            self.apply_task_speed(*id);
        }
        self.queues.remove(name);
        self.queue_order.retain(|q| q != name);
        self.schedule_save();
        self.start_queued();
    }

    fn rename_queue(&mut self, old_name: &str, new_name: &str) {
        let trimmed = new_name.trim().to_string();
        if trimmed.is_empty() || !self.queues.contains_key(old_name) || self.queues.contains_key(&trimmed)
        {
            return;
        }
        if let Some(mut info) = self.queues.remove(old_name) {
            info.name.clone_from(&trimmed);
            self.queues.insert(trimmed.clone(), info);
        }
        for name in &mut self.queue_order {
            if name == old_name {
                name.clone_from(&trimmed);
            }
        }
        let moved: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).is_some_and(|e| e.queue == old_name))
            .collect();
        for id in moved {
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.queue.clone_from(&trimmed);
                let category = entry.category.clone();
                self.model.update_metadata(id, &trimmed, &category);
            }
        }
        for rule_queue in self.domain_rules.values_mut() {
            if rule_queue == old_name {
                rule_queue.clone_from(&trimmed);
            }
        }
        self.schedule_save();
    }

    fn set_category_folder(&mut self, category: &str, folder: &str) {
        if category.is_empty() || category == "Auto" {
            return;
        }
        let mut normalized = normalize_file_path(folder.trim()).display().to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        if normalized.is_empty() {
            if self.category_folders.remove(category).is_some() {
                self.schedule_save();
            }
            return;
        }
        self.category_folders
            .insert(category.to_string(), normalized);
        self.schedule_save();
    }

    // ------------------------------------------------------------------
    // Probes, totals, snapshots
    // ------------------------------------------------------------------

    /// HEAD probe that reports status, size, and range support as a notice.
    fn test_url(&self, url_str: &str) {
        let Ok(url) = Url::parse(url_str) else {
            self.notify("Invalid URL", Severity::Danger);
            return;
        };
        let notices = self.notices_tx.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::builder().user_agent(USER_AGENT).build();
            let Ok(client) = client else {
                return;
            };
            match client.head(url).send().await {
                Err(error) => {
                    let _ = notices.send(Notice::new(
                        format!("Test failed: {error}"),
                        Severity::Danger,
                    ));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut message = format!("HTTP {status}");
                    if let Some(length) = response
                        .headers()
                        .get("content-length")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .filter(|&v| v > 0)
                    {
                        message.push_str(&format!(" • Size {length}"));
                    }
                    if let Some(ranges) = response
                        .headers()
                        .get("accept-ranges")
                        .and_then(|v| v.to_str().ok())
                    {
                        message.push_str(&format!(" • Ranges {ranges}"));
                    }
                    let _ = notices.send(Notice::new(message, Severity::Info));
                }
            }
        });
    }

    fn update_totals(&mut self) {
        let mut totals = Totals::default();
        for entry in self.tasks.values() {
            totals.speed += entry.speed;
            totals.received += entry.received;
            totals.total += entry.total;
        }
        self.totals = totals;
    }

    fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for entry in self.tasks.values() {
            if entry.task.is_running() {
                counts.active += 1;
            } else if entry.task.is_idle() {
                counts.queued += 1;
            }
        }
        counts.completed = self.model.finished_ids().len();
        counts
    }

    fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        let entry = self.tasks.get(&id)?;
        Some(TaskInfo {
            id,
            state: entry.task.state_str().to_string(),
            url: entry.task.current_url(),
            file_path: entry.task.file_path().to_path_buf(),
            received: entry.received,
            total: entry.total,
            queue_name: entry.queue.clone(),
            category: entry.category.clone(),
            mirror_index: entry.task.mirror_index(),
            resume_warning: entry.task.resume_warning().to_string(),
            checksum_state: entry.task.checksum.state,
            checksum_actual: entry.task.checksum.actual.clone(),
            pause_reason: entry.task.stats.pause_reason.clone(),
            retry_attempts: entry.retry_attempts,
        })
    }

    fn notify(&self, text: impl Into<String>, severity: Severity) {
        let _ = self.notices_tx.send(Notice::new(text, severity));
    }

    // ------------------------------------------------------------------
    // Import / export
    // ------------------------------------------------------------------

    async fn import_list(&mut self, path: &Path) {
        let Ok(raw) = tokio::fs::read_to_string(path).await else {
            self.notify("Import failed: cannot read file", Severity::Danger);
            return;
        };
        let entries = listio::parse_import(&raw);
        for ImportEntry {
            url,
            file_path,
            queue_name,
            category,
            start_paused,
        } in entries
        {
            let request = DownloadRequest {
                url,
                file_path: file_path.map(PathBuf::from),
                queue: queue_name,
                category,
                start_paused,
                options: TaskOptions::default(),
            };
            self.add_download(request);
        }
        self.notify("Imported downloads", Severity::Success);
    }

    async fn export_list(&mut self, path: &Path) {
        let mut items = Vec::new();
        for id in &self.order {
            let Some(entry) = self.tasks.get(id) else {
                continue;
            };
            items.push(ExportItem {
                url: entry.task.current_url(),
                file_path: entry.task.file_path().display().to_string(),
                queue_name: entry.queue.clone(),
                category: entry.category.clone(),
                state: entry.task.state_str().to_string(),
                bytes_received: entry.received,
                bytes_total: entry.total,
            });
        }
        let as_text = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
        let rendered = listio::render_export(as_text, &items);
        match tokio::fs::write(path, rendered).await {
            Ok(()) => self.notify("Exported list", Severity::Success),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "export failed");
                self.notify("Export failed", Severity::Danger);
            }
        }
    }

    // ------------------------------------------------------------------
    // Session persistence
    // ------------------------------------------------------------------

    fn schedule_save(&mut self) {
        if self.restore_in_progress {
            return;
        }
        self.session.schedule_save();
    }

    async fn flush_save(&mut self) {
        let data = self.build_session_data();
        if let Err(error) = self.session.save(&data).await {
            warn!(error = %error, "session save failed");
        }
    }

    fn build_session_data(&self) -> SessionData {
        let mut data = SessionData {
            max_concurrent: self.max_concurrent,
            global_max_speed: self.global_max_speed,
            pause_on_battery: self.pause_on_battery,
            resume_on_ac: self.resume_on_ac,
            ..SessionData::default()
        };

        for name in &self.queue_order {
            let Some(queue) = self.queues.get(name) else {
                continue;
            };
            data.queues.push(QueueRecord {
                name: queue.name.clone(),
                max_concurrent: queue.max_concurrent,
                max_speed: queue.max_speed,
                schedule_enabled: queue.schedule_enabled,
                start_minutes: queue.start_minutes,
                end_minutes: queue.end_minutes,
                quota_enabled: queue.quota_enabled,
                quota_bytes: queue.quota_bytes,
                downloaded_today: queue.downloaded_today,
                last_reset_date: queue.last_reset_date.format("%Y-%m-%d").to_string(),
            });
        }
        for (category, folder) in &self.category_folders {
            data.category_folders
                .insert(category.clone(), folder.clone());
        }
        for (host, queue) in &self.domain_rules {
            data.domain_rules.insert(host.clone(), queue.clone());
        }

        for id in &self.order {
            let Some(entry) = self.tasks.get(id) else {
                continue;
            };
            let task = &entry.task;
            data.items.push(ItemRecord {
                url: task.current_url(),
                file_path: task.file_path().display().to_string(),
                segments: task.segments(),
                queue_name: entry.queue.clone(),
                category: entry.category.clone(),
                state: task.state_str().to_string(),
                task_max_speed: entry.max_speed,
                bytes_received: entry.received,
                bytes_total: entry.total,
                last_speed: task.stats.last_speed,
                last_eta: task.stats.last_eta,
                paused_at: task.stats.paused_at_ms,
                pause_reason: task.stats.pause_reason.clone(),
                completed_at: entry.completed_at_ms,
                etag: task.etag().unwrap_or_default().to_string(),
                last_modified: task.last_modified().unwrap_or_default().to_string(),
                resume_warning: task.resume_warning().to_string(),
                mirrors: task.mirror_urls().to_vec(),
                mirror_index: task.mirror_index(),
                checksum_algo: task.checksum.algorithm.clone(),
                checksum_expected: task.checksum.expected.clone(),
                checksum_actual: task.checksum.actual.clone(),
                checksum_state: task.checksum.state.as_str().to_string(),
                verify_on_complete: task.verify_on_complete,
                post_open_file: task.post_actions.open_file,
                post_reveal_folder: task.post_actions.reveal_folder,
                post_extract: task.post_actions.extract,
                post_script: task.post_actions.script.clone(),
                retry_max: task.retry_max,
                retry_delay_sec: task.retry_delay_sec,
                headers: task.network.custom_headers.clone(),
                cookie_header: task.network.cookie_header.clone(),
                auth_user: task.network.auth_user.clone(),
                auth_password: task.network.auth_password.clone(),
                proxy: ProxyRecord {
                    host: task.network.proxy.host.clone(),
                    port: task.network.proxy.port,
                    user: task.network.proxy.user.clone(),
                    password: task.network.proxy.password.clone(),
                },
            });
        }
        data
    }

    async fn load_session(&mut self) {
        let Some(data) = self.session.load().await else {
            return;
        };
        info!(items = data.items.len(), queues = data.queues.len(), "restoring session");
        self.restore_in_progress = true;

        self.max_concurrent = data.max_concurrent.max(1);
        self.global_max_speed = data.global_max_speed;
        self.pause_on_battery = data.pause_on_battery;
        self.resume_on_ac = data.resume_on_ac;

        self.queues.clear();
        self.queue_order.clear();
        let today = Local::now().date_naive();
        for record in data.queues {
            if record.name.is_empty() {
                continue;
            }
            let mut info = QueueInfo::new(
                record.name.clone(),
                if record.max_concurrent > 0 {
                    record.max_concurrent
                } else {
                    self.max_concurrent
                },
                today,
            );
            info.max_speed = record.max_speed;
            info.schedule_enabled = record.schedule_enabled;
            info.start_minutes = record.start_minutes;
            info.end_minutes = record.end_minutes;
            info.quota_enabled = record.quota_enabled;
            info.quota_bytes = record.quota_bytes;
            info.downloaded_today = record.downloaded_today;
            info.last_reset_date =
                chrono::NaiveDate::parse_from_str(&record.last_reset_date, "%Y-%m-%d")
                    .unwrap_or(today);
            self.queue_order.push(record.name.clone());
            self.queues.insert(record.name, info);
        }
        self.ensure_default_queue();

        self.category_folders.clear();
        for (category, folder) in data.category_folders {
            if !category.is_empty() && !folder.is_empty() {
                self.category_folders.insert(category, folder);
            }
        }
        self.domain_rules.clear();
        for (host, queue) in data.domain_rules {
            let host = normalize_host(&host);
            if !host.is_empty() && !queue.is_empty() {
                self.domain_rules.insert(host, queue);
            }
        }

        for item in data.items {
            self.restore_item(item);
        }

        self.restore_in_progress = false;
        self.update_totals();
        self.start_queued();
    }

    fn restore_item(&mut self, item: ItemRecord) {
        if item.url.is_empty() || item.file_path.is_empty() {
            return;
        }
        let Ok(url) = Url::parse(&item.url) else {
            warn!(url = %item.url, "skipping unparsable session item");
            return;
        };

        let restored_path = normalize_file_path(&item.file_path);
        let file_path = try_guid_rename(&url, restored_path, item.segments);

        let queue_name = if item.queue_name.is_empty() {
            self.default_queue_name()
        } else {
            item.queue_name.clone()
        };
        if !self.queues.contains_key(&queue_name) {
            self.create_queue(&queue_name);
        }
        let category = if item.category.is_empty() {
            detect_category(&file_path.display().to_string()).to_string()
        } else {
            item.category.clone()
        };

        let id = self.create_task(url, file_path.clone(), queue_name, category, item.segments);
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        let task = &mut entry.task;

        let mirrors = if item.mirrors.is_empty() {
            vec![item.url.clone()]
        } else {
            item.mirrors.clone()
        };
        task.set_mirror_urls(mirrors);
        task.set_mirror_index(item.mirror_index);
        task.checksum.algorithm = item.checksum_algo;
        task.set_checksum_expected(item.checksum_expected);
        task.checksum.actual = item.checksum_actual;
        if !item.checksum_state.is_empty() {
            task.checksum.state = parse_checksum_state(&item.checksum_state);
        }
        task.verify_on_complete = item.verify_on_complete;
        task.post_actions.open_file = item.post_open_file;
        task.post_actions.reveal_folder = item.post_reveal_folder;
        task.post_actions.extract = item.post_extract;
        task.post_actions.script = item.post_script;
        task.retry_max = item.retry_max;
        task.retry_delay_sec = item.retry_delay_sec;
        task.network.custom_headers = item.headers;
        task.network.cookie_header = item.cookie_header;
        task.network.auth_user = item.auth_user;
        task.network.auth_password = item.auth_password;
        task.network.proxy.host = item.proxy.host;
        task.network.proxy.port = item.proxy.port;
        task.network.proxy.user = item.proxy.user;
        task.network.proxy.password = item.proxy.password;

        task.set_resume_info(
            (!item.etag.is_empty()).then(|| item.etag.clone()),
            (!item.last_modified.is_empty()).then(|| item.last_modified.clone()),
        );
        if !item.resume_warning.is_empty() {
            task.set_resume_warning(item.resume_warning.clone());
        }

        // Terminal and paused states are seeded without starting anything.
        match item.state.as_str() {
            "Paused" => task.mark_paused(),
            "Error" => task.mark_error(),
            "Done" => task.mark_done(),
            "Canceled" => task.mark_canceled(),
            _ => {}
        }
        let paused_at_seed = if item.state == "Paused" { item.paused_at } else { 0 };
        task.seed_persisted_stats(
            item.last_speed,
            item.last_eta,
            paused_at_seed,
            item.pause_reason.clone(),
        );

        // Byte counts come from disk when the persisted value is absent.
        let received = if item.bytes_received > 0 {
            item.bytes_received
        } else {
            bytes_received_on_disk(&file_path, item.segments)
        };
        entry.received = received;
        entry.last_received = received;
        entry.total = item.bytes_total;
        entry.max_speed = item.task_max_speed;
        entry.completed_at_ms = item.completed_at;

        self.model.update_progress(id, received, item.bytes_total);
        if matches!(item.state.as_str(), "Done" | "Canceled" | "Error") {
            self.model.set_finished(id, true);
        }
        if item.task_max_speed > 0 {
            self.apply_task_speed(id);
        }
    }
}

fn parse_checksum_state(value: &str) -> ChecksumState {
    match value {
        "Pending" => ChecksumState::Pending,
        "Verifying" => ChecksumState::Verifying,
        "OK" => ChecksumState::Ok,
        "Mismatch" => ChecksumState::Mismatch,
        "Computed" => ChecksumState::Computed,
        "Failed" => ChecksumState::Failed,
        "Unknown" => ChecksumState::Unknown,
        _ => ChecksumState::None,
    }
}

/// Renames a task's main file plus its `.part`/`.partN` siblings. Refuses
/// when both old and new main files exist.
fn rename_task_files_on_disk(old_path: &Path, new_path: &Path, segments: u32) -> bool {
    if old_path.as_os_str().is_empty() || new_path.as_os_str().is_empty() {
        return false;
    }
    if old_path == new_path {
        return true;
    }
    if new_path.exists() && old_path.exists() {
        return false;
    }

    let mut ok = true;
    if old_path.exists() {
        ok = ok && std::fs::rename(old_path, new_path).is_ok();
    }
    let old_single = single_part_path(old_path);
    if old_single.exists() {
        ok = ok && std::fs::rename(&old_single, single_part_path(new_path)).is_ok();
    }
    for i in 0..segments.max(1) {
        let old_part = segment_part_path(old_path, i);
        if old_part.exists() {
            ok = ok && std::fs::rename(&old_part, segment_part_path(new_path, i)).is_ok();
        }
    }
    ok
}

/// Swaps a GUID placeholder filename for the URL-derived one at restore,
/// renaming the main file and any part files that exist. When a rename is
/// unsafe the old path is kept.
fn try_guid_rename(url: &Url, old_path: PathBuf, segments: u32) -> PathBuf {
    let Some(old_name) = old_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return old_path;
    };
    if !looks_like_guid_name(&old_name) {
        return old_path;
    }
    let nice = file_name_from_url(url);
    if nice.is_empty() {
        return old_path;
    }
    let new_path = old_path.with_file_name(&nice);

    let mut switched = false;
    if old_path.exists() && !new_path.exists() && std::fs::rename(&old_path, &new_path).is_ok() {
        switched = true;
    }
    for i in 0..segments.max(1) {
        let old_part = segment_part_path(&old_path, i);
        if !old_part.exists() {
            continue;
        }
        let new_part = segment_part_path(&new_path, i);
        if new_part.exists() {
            continue;
        }
        if std::fs::rename(&old_part, &new_part).is_ok() {
            switched = true;
        }
    }
    if !switched {
        let any_old = old_path.exists()
            || (0..segments.max(1)).any(|i| segment_part_path(&old_path, i).exists());
        // Nothing on disk yet: prefer the nicer name for future writes.
        if !any_old {
            switched = true;
        }
    }

    if switched { new_path } else { old_path }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_effective_speed_min_ignoring_zeros() {
        assert_eq!(effective_speed(0, 0, 0), 0);
        assert_eq!(effective_speed(100, 0, 0), 100);
        assert_eq!(effective_speed(0, 50, 0), 50);
        assert_eq!(effective_speed(100, 50, 0), 50);
        assert_eq!(effective_speed(100, 50, 25), 25);
        assert_eq!(effective_speed(10, 50, 25), 10);
        assert_eq!(effective_speed(0, 0, 75), 75);
    }

    #[test]
    fn test_parse_checksum_state_round_trip() {
        for state in [
            ChecksumState::None,
            ChecksumState::Pending,
            ChecksumState::Verifying,
            ChecksumState::Ok,
            ChecksumState::Mismatch,
            ChecksumState::Computed,
            ChecksumState::Failed,
            ChecksumState::Unknown,
        ] {
            assert_eq!(parse_checksum_state(state.as_str()), state);
        }
    }

    #[test]
    fn test_rename_task_files_on_disk_moves_siblings() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old.bin");
        let new = temp.path().join("new.bin");
        std::fs::write(segment_part_path(&old, 0), b"a").unwrap();
        std::fs::write(segment_part_path(&old, 1), b"b").unwrap();
        std::fs::write(single_part_path(&old), b"c").unwrap();

        assert!(rename_task_files_on_disk(&old, &new, 4));
        assert!(segment_part_path(&new, 0).exists());
        assert!(segment_part_path(&new, 1).exists());
        assert!(single_part_path(&new).exists());
        assert!(!segment_part_path(&old, 0).exists());
    }

    #[test]
    fn test_rename_task_files_refuses_double_main() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old.bin");
        let new = temp.path().join("new.bin");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&new, b"y").unwrap();
        assert!(!rename_task_files_on_disk(&old, &new, 1));
    }

    #[test]
    fn test_guid_rename_prefers_nice_name_when_disk_empty() {
        let temp = TempDir::new().unwrap();
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        let old = temp.path().join("6f9619ff-8b86-d011-b42d-00cf4fc964ff");
        let renamed = try_guid_rename(&url, old, 4);
        assert_eq!(renamed.file_name().unwrap(), "report.pdf");
    }

    #[test]
    fn test_guid_rename_moves_existing_parts() {
        let temp = TempDir::new().unwrap();
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        let old = temp.path().join("6f9619ff-8b86-d011-b42d-00cf4fc964ff");
        std::fs::write(segment_part_path(&old, 0), b"abc").unwrap();

        let renamed = try_guid_rename(&url, old.clone(), 4);
        assert_eq!(renamed.file_name().unwrap(), "report.pdf");
        assert!(segment_part_path(&renamed, 0).exists());
        assert!(!segment_part_path(&old, 0).exists());
    }

    #[test]
    fn test_guid_rename_keeps_non_guid_names() {
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        let old = PathBuf::from("/d/notes.txt");
        assert_eq!(try_guid_rename(&url, old.clone(), 4), old);
    }
}
