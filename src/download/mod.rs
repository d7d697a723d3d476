//! Segmented HTTP transfer engine.
//!
//! This module owns everything between "a URL and a target path" and "bytes
//! on disk": the per-task state machine, segment planning, the throttled
//! write pipeline, and the filename/category utilities the manager uses to
//! place downloads.
//!
//! # Overview
//!
//! A download starts with a HEAD probe. When the origin reports a usable
//! `Content-Length` and `Accept-Ranges: bytes`, the transfer splits into
//! parallel byte-range segments, each streaming into its own `.partN` temp
//! file; completed segments merge into the final file. Origins without range
//! support (or with unknown size) fall back to a single stream, resuming
//! with `Range`/`If-Range` where possible.

pub mod category;
pub mod constants;
mod error;
pub mod filename;
pub mod segment;
pub mod throttle;
pub mod task;

pub use error::DownloadError;
pub use segment::{Segment, effective_segment_count, plan_segments};
pub use task::{
    ChecksumInfo, DownloaderTask, NetworkOptions, PostActions, ProxyConfig, TaskId, TaskState,
    TaskStats,
};
pub use throttle::ThrottleWindow;
