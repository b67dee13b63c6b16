use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Stand-in deadline for durations too long to represent: about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + duration`, saturating to a far-future instant instead of
/// overflowing.
pub fn deadline_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Fixed-interval pacing for a worker's send/receive loop.
///
/// Missed ticks are not queued: after a slow iteration at most one tick is
/// ready, and the schedule continues from there.
pub struct Pacer {
    ticker: Option<Interval>,
}

impl Pacer {
    /// A zero interval disables pacing.
    pub fn new(interval: Duration) -> Self {
        let ticker = (!interval.is_zero()).then(|| {
            let mut t = interval_at(Instant::now() + interval, interval);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        Self { ticker }
    }

    /// Wait for the next tick; returns immediately when unpaced.
    pub async fn wait(&mut self) {
        if let Some(t) = &mut self.ticker {
            t.tick().await;
        }
    }

    pub fn is_paced(&self) -> bool {
        self.ticker.is_some()
    }
}
