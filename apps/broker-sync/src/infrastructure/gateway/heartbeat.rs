//! Connection Heartbeat
//!
//! Once a connection is `READY` the client pings the gateway on a fixed
//! interval and expects a pong within a bounded window. Any inbound
//! traffic counts as liveness; a missed pong forces the socket closed so
//! the reconnect loop can take over.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Window for a pong response before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    /// Request to send an application-level ping.
    SendPing,
    /// Pong window elapsed; the connection should be torn down.
    Timeout,
}

/// Liveness state shared between the monitor and the socket loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    awaiting_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create fresh liveness state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }

    /// Mark that a ping went out and a pong is now expected.
    pub fn mark_ping_sent(&self) {
        self.awaiting_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a pong is currently outstanding.
    #[must_use]
    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::SeqCst)
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Reset for a fresh connection.
    pub fn reset(&self) {
        *self.last_activity.write() = Instant::now();
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }
}

/// Heartbeat monitor task.
///
/// Ticks on the ping interval; each tick first checks whether an
/// outstanding pong has exceeded its window (emitting
/// [`HeartbeatEvent::Timeout`] and exiting) and otherwise requests a
/// ping via [`HeartbeatEvent::SendPing`].
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the monitoring loop until cancelled or timed out.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh connection
        // gets a full interval before its first ping.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn check_and_ping(&self) -> Result<(), ()> {
        if self.state.is_awaiting_pong() {
            let idle = self.state.idle_for();
            if idle > self.config.pong_timeout {
                tracing::warn!(
                    idle_secs = idle.as_secs(),
                    timeout_secs = self.config.pong_timeout.as_secs(),
                    "heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return Err(());
            }
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("heartbeat channel closed, stopping monitor");
            return Err(());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn state_tracks_outstanding_pong() {
        let state = HeartbeatState::new();
        assert!(!state.is_awaiting_pong());

        state.mark_ping_sent();
        assert!(state.is_awaiting_pong());

        state.record_activity();
        assert!(!state.is_awaiting_pong());
    }

    #[test]
    fn any_activity_clears_outstanding_pong() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        // A data message, not just a pong, proves liveness.
        state.record_activity();
        assert!(!state.is_awaiting_pong());
        assert!(state.idle_for() < Duration::from_millis(100));
    }

    #[test]
    fn reset_clears_state() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        state.reset();
        assert!(!state.is_awaiting_pong());
    }

    #[tokio::test]
    async fn monitor_requests_pings() {
        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_secs(5));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let monitor = HeartbeatMonitor::new(config, state, event_tx, cancel.clone());
        let handle = tokio::spawn(monitor.run());

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should stay open");
        assert!(matches!(event, HeartbeatEvent::SendPing));

        cancel.cancel();
        handle.await.expect("monitor should stop");
    }

    #[tokio::test]
    async fn monitor_detects_missed_pong() {
        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(40));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        // Simulate a ping that never got answered.
        state.mark_ping_sent();
        {
            *state.last_activity.write() = Instant::now()
                .checked_sub(Duration::from_millis(200))
                .unwrap();
        }

        let monitor = HeartbeatMonitor::new(config, state, event_tx, cancel.clone());
        let handle = tokio::spawn(monitor.run());

        let mut saw_timeout = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), event_rx.recv()).await
        {
            if matches!(event, HeartbeatEvent::Timeout) {
                saw_timeout = true;
                break;
            }
        }
        assert!(saw_timeout, "monitor should emit a timeout");

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;
    }

    #[tokio::test]
    async fn monitor_stops_on_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let monitor = HeartbeatMonitor::new(config, state, event_tx, cancel.clone());
        let handle = tokio::spawn(monitor.run());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "monitor should shut down when cancelled");
    }
}
