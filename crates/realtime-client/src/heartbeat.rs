//! Keep-alive ticks while connected.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Drives periodic heartbeats from inside the connection loop.
///
/// The scheduler only produces ticks; the caller emits the frame. While stopped,
/// [`tick`](Self::tick) never resolves, so it can sit in a `select!` unconditionally.
#[derive(Debug)]
pub(crate) struct HeartbeatScheduler {
    period: Duration,
    interval: Option<Interval>,
}

impl HeartbeatScheduler {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// Start ticking; the first tick lands one full period from now.
    pub(crate) fn start(&mut self) {
        if self.period.is_zero() {
            tracing::warn!("heartbeat interval is zero, heartbeat disabled");
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        tracing::debug!(period_ms = self.period.as_millis() as u64, "heartbeat started");
    }

    pub(crate) fn stop(&mut self) {
        if self.interval.take().is_some() {
            tracing::debug!("heartbeat stopped");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next tick. Cancel-safe.
    pub(crate) async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
