//! Segment planning for multi-connection transfers.
//!
//! A segment is a contiguous inclusive byte range `[start, end]` fetched by
//! an independent ranged GET and written to its own `.partN` temp file. The
//! planner splits the total evenly (last segment absorbs the remainder) and
//! reconciles each range against whatever a previous run left on disk.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::constants::{FOUR_SEGMENT_THRESHOLD, SINGLE_SEGMENT_THRESHOLD, TWO_SEGMENT_THRESHOLD};
use super::filename::segment_part_path;

/// One byte range of a segmented transfer.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Zero-based position within the plan.
    pub index: u32,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
    /// Temp file receiving this range (`<file>.partN`).
    pub part_path: PathBuf,
    /// Bytes already persisted for this range.
    pub downloaded: u64,
}

impl Segment {
    /// Total length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Returns true when the range is empty (never produced by the planner).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Whether every byte of the range is already on disk.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.len()
    }
}

/// Applies the size-based cap to the configured segment count.
///
/// Small files do not benefit from extra connections, so the effective count
/// shrinks with the total: one segment under 4 MiB, at most two under
/// 32 MiB, at most four under 128 MiB, otherwise the configured count.
#[must_use]
pub fn effective_segment_count(total_size: u64, configured: u32) -> u32 {
    let configured = configured.max(1);
    if total_size < SINGLE_SEGMENT_THRESHOLD {
        1
    } else if total_size < TWO_SEGMENT_THRESHOLD {
        configured.min(2)
    } else if total_size < FOUR_SEGMENT_THRESHOLD {
        configured.min(4)
    } else {
        configured
    }
}

/// Builds the segment plan for `total_size` bytes of `file_path`.
///
/// For each range, an existing part file no larger than the range keeps its
/// size as the resume offset; an oversized or mismatched part is stale and is
/// removed so the range restarts at zero.
#[must_use]
pub fn plan_segments(file_path: &Path, total_size: u64, seg_count: u32) -> Vec<Segment> {
    let seg_count = seg_count.max(1);
    let seg_size = total_size / u64::from(seg_count);
    let mut segments = Vec::with_capacity(seg_count as usize);

    for i in 0..seg_count {
        let start = u64::from(i) * seg_size;
        let end = if i == seg_count - 1 {
            total_size - 1
        } else {
            (u64::from(i) + 1) * seg_size - 1
        };
        let part_path = segment_part_path(file_path, i);
        let seg_len = end - start + 1;

        let downloaded = match std::fs::metadata(&part_path) {
            Ok(meta) if meta.is_file() && meta.len() <= seg_len => meta.len(),
            Ok(_) => {
                debug!(part = %part_path.display(), "removing stale oversized part");
                let _ = std::fs::remove_file(&part_path);
                0
            }
            Err(_) => 0,
        };

        segments.push(Segment {
            index: i,
            start,
            end,
            part_path,
            downloaded,
        });
    }

    segments
}

/// Removes leftover part files from a previous, wider split.
pub fn remove_parts_beyond(file_path: &Path, from: u32, to: u32) {
    for i in from..to {
        let _ = std::fs::remove_file(segment_part_path(file_path, i));
    }
}
