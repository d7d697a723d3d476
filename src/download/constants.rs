//! Constants for the transfer engine (identification, thresholds, pacing).

use std::time::Duration;

/// User-Agent sent on every HEAD and GET issued by the engine.
pub const USER_AGENT: &str = "raad/1.0";

/// Default number of configured segments for new downloads.
pub const DEFAULT_SEGMENTS: u32 = 8;

/// Maximum accepted configured segment count.
pub const MAX_SEGMENTS: u32 = 16;

/// Below this total size a download is never split (4 MiB).
pub const SINGLE_SEGMENT_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Below this total size at most two segments are used (32 MiB).
pub const TWO_SEGMENT_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Below this total size at most four segments are used (128 MiB).
pub const FOUR_SEGMENT_THRESHOLD: u64 = 128 * 1024 * 1024;

/// Length of the rolling throttle window.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(1000);

/// Delay before re-checking the throttle window when no budget is left.
pub const THROTTLE_STALL_RETRY: Duration = Duration::from_millis(50);

/// Delay between partial writes while draining a buffered chunk.
pub const THROTTLE_DRAIN_RETRY: Duration = Duration::from_millis(10);

/// Copy buffer size used when merging segment part files (1 MiB).
pub const MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Minimum interval between speed/ETA samples reported by a transfer.
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum spacing between samples appended to a task's speed history.
pub const SPEED_HISTORY_SPACING_MS: i64 = 900;

/// Maximum retained speed-history samples per task.
pub const SPEED_HISTORY_LIMIT: usize = 120;

/// Maximum retained log lines per task.
pub const LOG_LINE_LIMIT: usize = 200;
