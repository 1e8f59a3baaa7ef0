use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connection::Connection;
use crate::visibility::Visibility;

/// Callback run on every executed poll tick.
pub type PollFn = Arc<dyn Fn() + Send + Sync>;

/// Identifies one polling timer within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Run the callback once as soon as the connection is ready, before the
    /// first tick.
    pub immediate: bool,
    /// Skip ticks that land while the page is hidden.
    pub visible_only: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            immediate: true,
            visible_only: true,
        }
    }
}

impl PollOptions {
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn visible_only(mut self, visible_only: bool) -> Self {
        self.visible_only = visible_only;
        self
    }
}

/// Spawn the interval task behind a poll.
///
/// The interval keeps running while the page is hidden or the connection is
/// down. Those ticks are dropped, not queued, and ticks missed by a stalled
/// runtime are skipped.
pub(crate) fn spawn_timer(
    session: String,
    period: Duration,
    callback: PollFn,
    visible_only: bool,
    visibility: Visibility,
    conn: Connection,
) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !conn.is_connected() {
                tracing::trace!(
                    session = %session,
                    state = %conn.state(),
                    "Not connected, skipping poll tick"
                );
                continue;
            }
            if visible_only && !visibility.is_visible() {
                tracing::trace!(session = %session, "Page hidden, skipping poll tick");
                continue;
            }
            callback();
        }
    })
}
