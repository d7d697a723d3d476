//! Rolling-window write throttle shared by all streams of one task.
//!
//! The budget is `max_speed` bytes per 1-second window. Every writer asks
//! for a grant before writing and commits what it actually wrote; the window
//! restarts once it is at least a second old. The counter is shared across a
//! task's segments behind one lock so concurrent writers cannot overrun the
//! cap, and the configured speed is an atomic so the cap can change while a
//! transfer is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::constants::{THROTTLE_DRAIN_RETRY, THROTTLE_STALL_RETRY, THROTTLE_WINDOW};

/// Per-task throttle window. Cheap to clone; clones share the same budget.
#[derive(Debug, Clone)]
pub struct ThrottleWindow {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Effective cap in bytes per second; 0 means unlimited.
    max_speed: AtomicU64,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    bytes_in_window: u64,
}

impl ThrottleWindow {
    /// Creates a window with the given cap (0 = unlimited).
    #[must_use]
    pub fn new(max_speed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_speed: AtomicU64::new(max_speed),
                state: Mutex::new(WindowState {
                    window_start: Instant::now(),
                    bytes_in_window: 0,
                }),
            }),
        }
    }

    /// Replaces the cap. Takes effect on the next grant.
    pub fn set_max_speed(&self, bytes_per_sec: u64) {
        self.inner.max_speed.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Current cap in bytes per second (0 = unlimited).
    #[must_use]
    pub fn max_speed(&self) -> u64 {
        self.inner.max_speed.load(Ordering::Relaxed)
    }

    /// Returns how many of `want` bytes may be written right now.
    ///
    /// The budget is the elapsed fraction of the current window times the
    /// cap, minus what has already been written into the window. Zero means
    /// the caller should back off briefly.
    pub async fn grant(&self, want: u64) -> u64 {
        let max_speed = self.max_speed();
        if max_speed == 0 {
            return want;
        }
        let state = self.inner.state.lock().await;
        let elapsed_ms = u64::try_from(state.window_start.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let budget = (max_speed.saturating_mul(elapsed_ms) / 1000).saturating_sub(state.bytes_in_window);
        budget.min(want)
    }

    /// Records `written` bytes against the window and restarts it when it is
    /// at least a full window old.
    pub async fn commit(&self, written: u64) {
        let mut state = self.inner.state.lock().await;
        state.bytes_in_window += written;
        if state.window_start.elapsed() >= THROTTLE_WINDOW {
            state.window_start = Instant::now();
            state.bytes_in_window = 0;
        }
    }
}

/// Writes `chunk` through the throttle, pacing partial writes.
///
/// When no budget is available the writer sleeps 50 ms before re-checking;
/// between partial writes of one chunk it sleeps 10 ms so other streams get
/// a turn at the window.
pub async fn write_throttled<W>(
    writer: &mut W,
    throttle: &ThrottleWindow,
    chunk: &[u8],
) -> std::io::Result<u64>
where
    W: AsyncWriteExt + Unpin,
{
    let mut remaining = chunk;
    let mut written_total = 0u64;

    while !remaining.is_empty() {
        let granted = throttle.grant(remaining.len() as u64).await;
        if granted == 0 {
            tokio::time::sleep(THROTTLE_STALL_RETRY).await;
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let take = granted.min(remaining.len() as u64) as usize;
        writer.write_all(&remaining[..take]).await?;
        throttle.commit(take as u64).await;
        written_total += take as u64;
        remaining = &remaining[take..];
        if !remaining.is_empty() {
            tokio::time::sleep(THROTTLE_DRAIN_RETRY).await;
        }
    }

    Ok(written_total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_grants_everything() {
        let throttle = ThrottleWindow::new(0);
        assert_eq!(throttle.grant(1_000_000).await, 1_000_000);
    }

    #[tokio::test]
    async fn test_grant_respects_window_budget() {
        tokio::time::pause();
        let throttle = ThrottleWindow::new(1000);

        // Half a window in: budget is ~500 bytes.
        tokio::time::advance(Duration::from_millis(500)).await;
        let granted = throttle.grant(10_000).await;
        assert!(granted <= 500, "granted {granted} exceeds half-window budget");

        throttle.commit(granted).await;
        let again = throttle.grant(10_000).await;
        assert_eq!(again, 0, "budget must be exhausted after commit");
    }

    #[tokio::test]
    async fn test_window_restarts_after_one_second() {
        tokio::time::pause();
        let throttle = ThrottleWindow::new(1000);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let granted = throttle.grant(10_000).await;
        assert!(granted >= 1000);
        throttle.commit(granted).await;

        // The commit crossed the window boundary, so a fresh window begins.
        tokio::time::advance(Duration::from_millis(500)).await;
        let next = throttle.grant(10_000).await;
        assert!(next > 0, "new window must grant budget again");
    }

    #[tokio::test]
    async fn test_shared_clones_share_budget() {
        tokio::time::pause();
        let a = ThrottleWindow::new(1000);
        let b = a.clone();

        tokio::time::advance(Duration::from_millis(1000)).await;
        let granted = a.grant(800).await;
        a.commit(granted).await;
        // The sibling sees the same spent budget.
        let granted_b = b.grant(10_000).await;
        assert!(granted_b <= 1200 - granted, "clone must observe shared counter");
    }

    #[tokio::test]
    async fn test_set_max_speed_applies_to_next_grant() {
        let throttle = ThrottleWindow::new(0);
        throttle.set_max_speed(1);
        // With a 1 B/s cap, an immediate large request is clipped hard.
        let granted = throttle.grant(1_000_000).await;
        assert!(granted <= 1);
    }

    #[tokio::test]
    async fn test_write_throttled_writes_whole_chunk_when_unlimited() {
        let throttle = ThrottleWindow::new(0);
        let mut sink = std::io::Cursor::new(Vec::new());
        let n = write_throttled(&mut sink, &throttle, b"hello world").await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(sink.into_inner(), b"hello world");
    }
}
