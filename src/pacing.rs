use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest single sleep before the cancellation token is checked again.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    /// Already at or behind the packet's presentation time.
    OnTime,
    Slept(Duration),
    /// The lead exceeded the ceiling; the time origin was moved to now.
    Resynced,
    Cancelled,
}

/// Holds emission to wall-clock speed: a packet whose pts is `d` past the
/// origin is released no earlier than `d` after the origin instant.
#[derive(Debug, Clone)]
pub struct RealtimePacer {
    ceiling: Duration,
    origin: Option<(Instant, i64)>,
}

impl RealtimePacer {
    pub fn new(ceiling: Duration) -> Self {
        Self { ceiling, origin: None }
    }

    pub fn reset(&mut self) {
        self.origin = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.origin.is_some()
    }

    /// Pins the origin to `pts_us` at the current instant.
    pub fn anchor(&mut self, pts_us: i64) {
        self.origin = Some((Instant::now(), pts_us));
    }

    /// How long to wait before presenting `pts_us`, or `None` when the lead
    /// is beyond the ceiling. The first call anchors and returns zero.
    pub fn delay_for(&mut self, pts_us: i64) -> Option<Duration> {
        let (start, origin_pts) = match self.origin {
            Some(origin) => origin,
            None => {
                self.anchor(pts_us);
                return Some(Duration::ZERO);
            }
        };
        let wanted = pts_us.saturating_sub(origin_pts);
        let elapsed = start.elapsed().as_micros() as i64;
        let lead = wanted.saturating_sub(elapsed);
        if lead <= 0 {
            return Some(Duration::ZERO);
        }
        let lead = Duration::from_micros(lead as u64);
        if lead >= self.ceiling {
            None
        } else {
            Some(lead)
        }
    }

    /// Blocks the calling thread until `pts_us` is due. Never holds a lock.
    pub fn pace(&mut self, pts_us: i64, cancel: &CancellationToken) -> PaceOutcome {
        match self.delay_for(pts_us) {
            None => {
                debug!(pts_us, "pacing desync, resetting time origin");
                self.anchor(pts_us);
                PaceOutcome::Resynced
            }
            Some(wait) if wait.is_zero() => PaceOutcome::OnTime,
            Some(wait) => {
                if sleep_cancellable(wait, cancel) {
                    PaceOutcome::Slept(wait)
                } else {
                    PaceOutcome::Cancelled
                }
            }
        }
    }
}

/// Sleeps for `total` in slices, returning false as soon as `cancel` fires.
pub fn sleep_cancellable(total: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
