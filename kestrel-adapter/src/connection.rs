//! Per-channel connection state machine with exponential backoff.

use chrono::{DateTime, Duration, Utc};
use kestrel_core::ConnectionState;
use tracing::{info, warn};

const BASE_DELAY_SECS: i64 = 30;
const MAX_DELAY_SECS: i64 = 300;

/// What the caller should do after reporting a connection failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackoffVerdict {
    /// Wait until the stored deadline, then attempt again.
    Retry,
    /// Initial-connect retry cap exhausted; emit `AccountDisconnected{1}`.
    GiveUp,
    /// A previously-connected channel dropped; emit `AccountDisconnected{2}`
    /// once and keep retrying indefinitely.
    LostConnection,
}

/// Tracks one broker channel (API or feed) through
/// `Disconnected -> Connecting -> Connected` with `Backoff`/`Failed` arms.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    channel: &'static str,
    state: ConnectionState,
    consecutive_failures: u32,
    retry_cap: u32,
    next_attempt: Option<DateTime<Utc>>,
    ever_connected: bool,
    loss_reported: bool,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(channel: &'static str, retry_cap: u32) -> Self {
        Self {
            channel,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            retry_cap,
            next_attempt: None,
            ever_connected: false,
            loss_reported: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Delay before the k-th consecutive retry: `min(300s, 30 * 2^k)`.
    #[must_use]
    pub fn backoff_delay(k: u32) -> Duration {
        let exp = BASE_DELAY_SECS.saturating_mul(1_i64 << k.min(16));
        Duration::seconds(exp.min(MAX_DELAY_SECS))
    }

    /// Whether a connect attempt should be made now.
    #[must_use]
    pub fn should_attempt(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ConnectionState::Disconnected => true,
            ConnectionState::Backoff => self
                .next_attempt
                .map(|deadline| now >= deadline)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Mark the start of a connect attempt.
    pub fn on_attempt(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The channel came up. Returns true when this recovers a reported loss.
    pub fn on_connected(&mut self) -> bool {
        let recovered = self.loss_reported;
        if !self.is_connected() {
            info!(channel = self.channel, "broker channel connected");
        }
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.next_attempt = None;
        self.ever_connected = true;
        self.loss_reported = false;
        recovered
    }

    /// Graceful close: back to Disconnected with counters cleared.
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures = 0;
        self.next_attempt = None;
        self.loss_reported = false;
    }

    /// A connect attempt failed, or an established channel dropped.
    pub fn on_failure(&mut self, now: DateTime<Utc>) -> BackoffVerdict {
        let was_connected = self.state == ConnectionState::Connected;
        self.consecutive_failures += 1;
        let k = self.consecutive_failures.saturating_sub(1);
        let delay = Self::backoff_delay(k);

        if was_connected || self.ever_connected {
            // Transient loss: report once, retry without a cap.
            self.state = ConnectionState::Backoff;
            self.next_attempt = Some(now + delay);
            warn!(
                channel = self.channel,
                failures = self.consecutive_failures,
                delay_secs = delay.num_seconds(),
                "broker channel lost, backing off"
            );
            if !self.loss_reported {
                self.loss_reported = true;
                return BackoffVerdict::LostConnection;
            }
            return BackoffVerdict::Retry;
        }

        if self.consecutive_failures >= self.retry_cap {
            self.state = ConnectionState::Failed;
            self.next_attempt = None;
            warn!(
                channel = self.channel,
                failures = self.consecutive_failures,
                "broker channel failed permanently"
            );
            return BackoffVerdict::GiveUp;
        }

        self.state = ConnectionState::Backoff;
        self.next_attempt = Some(now + delay);
        warn!(
            channel = self.channel,
            failures = self.consecutive_failures,
            delay_secs = delay.num_seconds(),
            "broker connect failed, backing off"
        );
        BackoffVerdict::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let mut prev = Duration::zero();
        for k in 0..12 {
            let delay = ConnectionSupervisor::backoff_delay(k);
            assert!(delay >= prev, "delay must not shrink (k={k})");
            assert!(delay <= Duration::seconds(300));
            prev = delay;
        }
        assert_eq!(ConnectionSupervisor::backoff_delay(0), Duration::seconds(30));
        assert_eq!(ConnectionSupervisor::backoff_delay(8), Duration::seconds(300));
    }

    #[test]
    fn initial_failures_exhaust_the_cap() {
        let now = Utc::now();
        let mut sup = ConnectionSupervisor::new("api", 3);
        sup.on_attempt();
        assert_eq!(sup.on_failure(now), BackoffVerdict::Retry);
        assert_eq!(sup.state(), ConnectionState::Backoff);
        sup.on_attempt();
        assert_eq!(sup.on_failure(now), BackoffVerdict::Retry);
        sup.on_attempt();
        assert_eq!(sup.on_failure(now), BackoffVerdict::GiveUp);
        assert_eq!(sup.state(), ConnectionState::Failed);
    }

    #[test]
    fn established_channel_loss_reports_once_and_retries_forever() {
        let now = Utc::now();
        let mut sup = ConnectionSupervisor::new("feed", 2);
        sup.on_attempt();
        assert!(!sup.on_connected());
        assert_eq!(sup.on_failure(now), BackoffVerdict::LostConnection);
        // Well past the cap, still only retries.
        for _ in 0..10 {
            sup.on_attempt();
            assert_eq!(sup.on_failure(now), BackoffVerdict::Retry);
        }
        assert_eq!(sup.state(), ConnectionState::Backoff);
        // Recovery clears the loss flag.
        sup.on_attempt();
        assert!(sup.on_connected());
        assert_eq!(sup.on_failure(now), BackoffVerdict::LostConnection);
    }

    #[test]
    fn attempt_gating_honors_the_deadline() {
        let now = Utc::now();
        let mut sup = ConnectionSupervisor::new("api", 10);
        assert!(sup.should_attempt(now));
        sup.on_attempt();
        sup.on_failure(now);
        assert!(!sup.should_attempt(now));
        assert!(sup.should_attempt(now + Duration::seconds(31)));
    }
}
