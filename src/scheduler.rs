use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The sampling instant that was due, not the actual wake-up time.
    Tick(DateTime<Utc>),
    Cancelled,
}

/// Produces wall-clock ticks aligned to multiples of the interval since the epoch.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Sleeps until the next boundary. Boundaries missed while the host was
    /// busy or suspended are skipped, not caught up.
    pub async fn next_tick(&mut self, cancel: &CancellationToken) -> TickOutcome {
        if cancel.is_cancelled() {
            return TickOutcome::Cancelled;
        }
        let boundary = next_boundary(Utc::now(), self.interval, self.last);
        if let Some(last) = self.last {
            let skipped = (boundary - last).num_milliseconds() / interval_millis(self.interval) - 1;
            if skipped > 0 {
                warn!(skipped, %last, next = %boundary, "missed sampling ticks");
            }
        }

        let delay = (boundary - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => TickOutcome::Cancelled,
            _ = sleep(delay) => {
                self.last = Some(boundary);
                TickOutcome::Tick(boundary)
            }
        }
    }
}

fn interval_millis(interval: Duration) -> i64 {
    (interval.as_millis() as i64).max(1)
}

/// First multiple of `interval` at or after `now`, strictly after `last`.
pub fn next_boundary(
    now: DateTime<Utc>,
    interval: Duration,
    last: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let step = interval_millis(interval);
    let now_ms = now.timestamp_millis();
    let mut boundary_ms = now_ms.div_euclid(step) * step;
    if boundary_ms < now_ms {
        boundary_ms += step;
    }
    if let Some(last) = last {
        let last_ms = last.timestamp_millis();
        if boundary_ms <= last_ms {
            boundary_ms = last_ms + step;
        }
    }
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(boundary_ms)
}
