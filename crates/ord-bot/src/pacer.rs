//! Global sliding-window admission control for bid submissions.
//!
//! The pacer bounds how many bids leave this process per window. Callers
//! that must submit use `wait_for_slot` (suspends the task, never blocks the
//! runtime); callers that can shed load (the scheduled cycle) use
//! `is_limited`/`reset_wait` and skip instead of stalling.
//!
//! `on_rejected` handles the case where the API reports a rate violation
//! despite local pacing (clock skew, quota shared with another process): it
//! forces an additional cool-down beyond the local window. Retry policy for
//! 429s lives here, never in the transport layer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Pacer configuration.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Window length.
    pub window: Duration,
    /// Maximum sends per window.
    pub max_per_window: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 5,
        }
    }
}

#[derive(Debug)]
struct PacerState {
    sent: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// Sliding-window rate pacer.
#[derive(Debug)]
pub struct RatePacer {
    config: PacerConfig,
    state: Mutex<PacerState>,
}

impl RatePacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PacerState {
                sent: VecDeque::new(),
                cooldown_until: None,
            }),
        }
    }

    /// Suspend until a slot is available. Callers record the actual send
    /// with `record_sent` afterwards.
    pub async fn wait_for_slot(&self) {
        loop {
            let wait = self.reset_wait();
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a bid submission at the current instant.
    pub fn record_sent(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.sent.push_back(now);
        Self::prune(&mut state.sent, now, self.config.window);
    }

    /// The API reported a rate violation despite local pacing. Extend the
    /// cool-down a full window past now.
    pub fn on_rejected(&self) {
        let mut state = self.state.lock();
        let until = Instant::now() + self.config.window;
        state.cooldown_until = Some(until);
        warn!(
            cooldown_secs = self.config.window.as_secs(),
            "marketplace reported rate violation, extending cool-down"
        );
    }

    /// Whether a send right now would exceed the window.
    pub fn is_limited(&self) -> bool {
        !self.reset_wait().is_zero()
    }

    /// Time until the next slot frees. Zero when a send is admissible now.
    pub fn reset_wait(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();

        let cooldown = match state.cooldown_until {
            Some(until) if until > now => until - now,
            _ => {
                state.cooldown_until = None;
                Duration::ZERO
            }
        };

        Self::prune(&mut state.sent, now, self.config.window);
        let window_wait = if state.sent.len() < self.config.max_per_window {
            Duration::ZERO
        } else {
            // Oldest in-window send ages out first.
            let oldest = state.sent[state.sent.len() - self.config.max_per_window];
            (oldest + self.config.window).saturating_duration_since(now)
        };

        cooldown.max(window_wait)
    }

    fn prune(sent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = sent.front() {
            if now.duration_since(*front) > window {
                sent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pacer() -> RatePacer {
        RatePacer::new(PacerConfig {
            window: Duration::from_millis(200),
            max_per_window: 2,
        })
    }

    #[test]
    fn test_unlimited_until_cap_reached() {
        let pacer = small_pacer();
        assert!(!pacer.is_limited());
        pacer.record_sent();
        assert!(!pacer.is_limited());
        pacer.record_sent();
        assert!(pacer.is_limited());
        assert!(pacer.reset_wait() > Duration::ZERO);
    }

    #[test]
    fn test_window_ages_out() {
        let pacer = small_pacer();
        pacer.record_sent();
        pacer.record_sent();
        assert!(pacer.is_limited());
        std::thread::sleep(Duration::from_millis(250));
        assert!(!pacer.is_limited());
    }

    #[test]
    fn test_rejection_extends_cooldown_beyond_window() {
        let pacer = small_pacer();
        assert!(!pacer.is_limited());
        pacer.on_rejected();
        assert!(pacer.is_limited());
        // Cool-down is a full window even with zero local sends.
        assert!(pacer.reset_wait() > Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_wait_for_slot_suspends_then_admits() {
        let pacer = small_pacer();
        pacer.record_sent();
        pacer.record_sent();

        let started = Instant::now();
        pacer.wait_for_slot().await;
        // Must have waited for the oldest send to age out.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!pacer.is_limited());
    }

    #[tokio::test]
    async fn test_wait_for_slot_immediate_when_free() {
        let pacer = small_pacer();
        let started = Instant::now();
        pacer.wait_for_slot().await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
