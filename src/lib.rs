//! raad: a multi-queue segmented download engine.
//!
//! The engine accepts HTTP(S) downloads, splits each transfer into parallel
//! byte-range segments when the origin allows, enforces per-task, per-queue,
//! and global bandwidth budgets, survives restarts by resuming from partial
//! on-disk state, and drives retries, mirror failover, and scheduled, quota,
//! and battery-aware pause/resume cycles.
//!
//! # Architecture
//!
//! - [`download`]: the per-task transfer state machine with segment planning,
//!   throttled writes, range resume, and atomic finalization.
//! - [`manager`]: the actor that owns tasks and queues, admits work under
//!   scheduling and quota constraints, and persists the session.
//! - [`session`]: versioned JSON persistence with debounced atomic writes.
//! - [`model`]: the ordered read-only projection consumed by front ends.
//! - [`checksum`], [`power`], [`platform`]: the hashing oracle and the
//!   injected host-system collaborators.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checksum;
pub mod download;
pub mod manager;
pub mod model;
pub mod platform;
pub mod power;
pub mod session;

// Re-export commonly used types
pub use checksum::{ChecksumAlgorithm, ChecksumState};
pub use download::{DownloadError, DownloaderTask, TaskId, TaskState, ThrottleWindow};
pub use manager::events::{Notice, Severity};
pub use manager::{
    Counts, DownloadManager, DownloadRequest, ManagerConfig, ManagerHandle, TaskInfo, TaskOptions,
    Totals,
};
pub use model::{DownloadModel, ModelRow, SortField};
pub use platform::{NoopPlatform, PlatformOps, SystemPlatform};
pub use power::{PowerSource, StaticPower, SystemPower};
pub use session::{SessionData, SessionStore};
