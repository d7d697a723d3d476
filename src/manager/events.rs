//! Typed events flowing into the manager's mailbox, and user-facing notices.
//!
//! Transfer runners never touch manager or task state directly; everything
//! they learn is posted here and applied on the manager's loop. Events carry
//! the generation of the run that produced them so anything arriving after a
//! pause, cancel, or restart is recognized as stale and dropped.

use crate::download::task::TaskId;

/// Events produced by transfer runners, retry timers, and the checksum
/// worker. One mailbox, one consumer.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// A transfer-run event, stamped with the run's generation.
    Task {
        id: TaskId,
        generation: u64,
        event: TaskEvent,
    },
    /// A scheduled retry delay elapsed.
    RetryDue { id: TaskId },
    /// The hashing worker finished; `None` means the file could not be read.
    ChecksumDone { id: TaskId, digest: Option<String> },
}

/// Per-run events reported by a transfer.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    /// HEAD (or first GET) resolved the total size and range support.
    Metadata { total_size: u64, supports_range: bool },
    /// Fresh resume validators observed on a response.
    Validators {
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// Byte progress; `total` is 0 while unknown.
    Progress { received: u64, total: u64 },
    /// Periodic speed/ETA sample. `eta_secs` is -1 while unknown.
    SpeedSample { bytes_per_sec: u64, eta_secs: i64 },
    /// A resume or range downgrade happened; shown to the user.
    ResumeWarning(String),
    /// A line for the task's rolling log.
    LogLine(String),
    /// The run reached a terminal outcome.
    Finished { success: bool },
}

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Success,
    Danger,
    Muted,
}

impl Severity {
    /// Stable string form used by front ends.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Danger => "danger",
            Self::Muted => "muted",
        }
    }
}

/// A user-facing notification (toast surface).
#[derive(Debug, Clone)]
pub struct Notice {
    pub text: String,
    pub severity: Severity,
}

impl Notice {
    pub(crate) fn new(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            severity,
        }
    }
}
