//! Liveness tracking and restart decisions for the oracle process.
//!
//! The monitor is passive: the bridge reports starts, exits, errors and
//! timeouts, and asks [`HealthMonitor::restart_decision`] whether a crashed
//! oracle should be brought back. Crash loops are bounded by a maximum number
//! of restarts inside a sliding window, with exponential backoff between
//! attempts.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;

use crate::error::LockResultExt;

const LOG_TARGET: &str = "oracle_ls::health";

/// Number of error samples kept for the health snapshot.
pub const RECENT_ERROR_LIMIT: usize = 5;

/// Upper bound on the delay between restart attempts.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed inside `window` before giving up.
    pub max_restarts: u32,
    pub window: Duration,
    /// Delay before the first restart in a window; doubles per attempt.
    pub backoff: Duration,
    /// Consecutive call timeouts that count as a hung oracle.
    pub max_consecutive_timeouts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(250),
            max_consecutive_timeouts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration, attempt: u32 },
    GiveUp { restarts_in_window: u32 },
}

/// One recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSample {
    pub message: String,
    /// Wall-clock time of the error, milliseconds since the Unix epoch.
    pub at_unix_ms: u64,
}

/// Point-in-time view of the bridge and its oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Time since the current oracle process was started; zero when none is.
    pub uptime_ms: u64,
    pub bridge_connected: bool,
    pub subprocess_alive: bool,
    pub pid: Option<u32>,
    pub version: Option<String>,
    pub generation: u64,
    pub restarts: u32,
    pub pending: usize,
    pub consecutive_timeouts: u32,
    pub recent_errors: Vec<ErrorSample>,
}

impl HealthStatus {
    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.uptime_ms)
    }
}

#[derive(Debug, Default)]
struct HealthState {
    alive: bool,
    pid: Option<u32>,
    version: Option<String>,
    generation: u64,
    started_at: Option<Instant>,
    restarts: u32,
    restart_times: VecDeque<Instant>,
    consecutive_timeouts: u32,
    recent_errors: VecDeque<ErrorSample>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    policy: RestartPolicy,
    state: Mutex<HealthState>,
}

impl HealthMonitor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HealthState::default()),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// A new oracle process is up.
    pub fn record_start(&self, pid: Option<u32>, generation: u64) {
        let mut state = self.state.lock().recover_poison("HealthMonitor::record_start");
        state.alive = true;
        state.pid = pid;
        state.generation = generation;
        state.started_at = Some(Instant::now());
        state.version = None;
        state.consecutive_timeouts = 0;
    }

    /// The oracle process is gone, whether by crash or by request.
    pub fn record_exit(&self, reason: &str) {
        let mut state = self.state.lock().recover_poison("HealthMonitor::record_exit");
        state.alive = false;
        state.pid = None;
        state.started_at = None;
        drop(state);
        info!(target: LOG_TARGET, "Oracle stopped: {}", reason);
    }

    pub fn record_version(&self, version: String) {
        self.state
            .lock()
            .recover_poison("HealthMonitor::record_version")
            .version = Some(version);
    }

    /// Keep an error sample; only the last [`RECENT_ERROR_LIMIT`] are kept.
    pub fn record_error(&self, message: impl Into<String>) {
        let sample = ErrorSample {
            message: message.into(),
            at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        let mut state = self.state.lock().recover_poison("HealthMonitor::record_error");
        if state.recent_errors.len() == RECENT_ERROR_LIMIT {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(sample);
    }

    /// Count a call timeout. Returns true when the threshold is reached, in
    /// which case the counter starts over.
    pub fn record_timeout(&self) -> bool {
        let mut state = self.state.lock().recover_poison("HealthMonitor::record_timeout");
        state.consecutive_timeouts += 1;
        if state.consecutive_timeouts >= self.policy.max_consecutive_timeouts {
            warn!(
                target: LOG_TARGET,
                "{} consecutive timeouts; oracle considered unresponsive",
                state.consecutive_timeouts
            );
            state.consecutive_timeouts = 0;
            true
        } else {
            false
        }
    }

    /// Any response resets the consecutive timeout count.
    pub fn record_success(&self) {
        self.state
            .lock()
            .recover_poison("HealthMonitor::record_success")
            .consecutive_timeouts = 0;
    }

    /// Decide whether to restart after an unexpected exit.
    ///
    /// A `Restart` decision counts as an attempt against the window.
    pub fn restart_decision(&self) -> RestartDecision {
        self.restart_decision_at(Instant::now())
    }

    fn restart_decision_at(&self, now: Instant) -> RestartDecision {
        let mut state = self
            .state
            .lock()
            .recover_poison("HealthMonitor::restart_decision");

        while let Some(&oldest) = state.restart_times.front() {
            if now.saturating_duration_since(oldest) > self.policy.window {
                state.restart_times.pop_front();
            } else {
                break;
            }
        }

        let in_window = state.restart_times.len() as u32;
        if in_window >= self.policy.max_restarts {
            return RestartDecision::GiveUp {
                restarts_in_window: in_window,
            };
        }

        state.restart_times.push_back(now);
        state.restarts += 1;
        let delay = self
            .policy
            .backoff
            .saturating_mul(1u32 << in_window.min(16))
            .min(MAX_RESTART_BACKOFF);
        RestartDecision::Restart {
            delay,
            attempt: in_window + 1,
        }
    }

    pub fn snapshot(&self, bridge_connected: bool, pending: usize) -> HealthStatus {
        let state = self.state.lock().recover_poison("HealthMonitor::snapshot");
        HealthStatus {
            uptime_ms: state
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            bridge_connected,
            subprocess_alive: state.alive,
            pid: state.pid,
            version: state.version.clone(),
            generation: state.generation,
            restarts: state.restarts,
            pending,
            consecutive_timeouts: state.consecutive_timeouts,
            recent_errors: state.recent_errors.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(100),
            max_consecutive_timeouts: 3,
        }
    }

    #[test]
    fn keeps_only_last_five_errors() {
        let monitor = HealthMonitor::new(RestartPolicy::default());
        for i in 0..8 {
            monitor.record_error(format!("error {}", i));
        }

        let status = monitor.snapshot(true, 0);
        let messages: Vec<_> = status.recent_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["error 3", "error 4", "error 5", "error 6", "error 7"]
        );
    }

    #[test]
    fn restart_backoff_doubles_then_gives_up() {
        let monitor = HealthMonitor::new(policy(3));
        let now = Instant::now();

        assert_eq!(
            monitor.restart_decision_at(now),
            RestartDecision::Restart {
                delay: Duration::from_millis(100),
                attempt: 1
            }
        );
        assert_eq!(
            monitor.restart_decision_at(now),
            RestartDecision::Restart {
                delay: Duration::from_millis(200),
                attempt: 2
            }
        );
        assert_eq!(
            monitor.restart_decision_at(now),
            RestartDecision::Restart {
                delay: Duration::from_millis(400),
                attempt: 3
            }
        );
        assert_eq!(
            monitor.restart_decision_at(now),
            RestartDecision::GiveUp {
                restarts_in_window: 3
            }
        );
    }

    #[test]
    fn restarts_outside_window_are_forgotten() {
        let monitor = HealthMonitor::new(policy(1));
        let start = Instant::now();

        assert!(matches!(
            monitor.restart_decision_at(start),
            RestartDecision::Restart { .. }
        ));
        assert!(matches!(
            monitor.restart_decision_at(start + Duration::from_secs(30)),
            RestartDecision::GiveUp { .. }
        ));
        assert!(matches!(
            monitor.restart_decision_at(start + Duration::from_secs(61)),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }

    #[test]
    fn backoff_is_capped() {
        let monitor = HealthMonitor::new(RestartPolicy {
            max_restarts: 10,
            backoff: Duration::from_secs(1),
            ..RestartPolicy::default()
        });
        let now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let RestartDecision::Restart { delay, .. } = monitor.restart_decision_at(now) {
                last = delay;
            }
        }
        assert_eq!(last, MAX_RESTART_BACKOFF);
    }

    #[test]
    fn timeouts_escalate_at_threshold_and_success_resets() {
        let monitor = HealthMonitor::new(policy(5));

        assert!(!monitor.record_timeout());
        assert!(!monitor.record_timeout());
        monitor.record_success();
        assert!(!monitor.record_timeout());
        assert!(!monitor.record_timeout());
        assert!(monitor.record_timeout());
        assert_eq!(monitor.snapshot(true, 0).consecutive_timeouts, 0);
    }

    #[test]
    fn snapshot_reflects_lifecycle() {
        let monitor = HealthMonitor::new(RestartPolicy::default());
        monitor.record_start(Some(42), 1);
        monitor.record_version("Pike v8.0".to_string());

        let status = monitor.snapshot(true, 2);
        assert!(status.subprocess_alive);
        assert_eq!(status.pid, Some(42));
        assert_eq!(status.generation, 1);
        assert_eq!(status.version.as_deref(), Some("Pike v8.0"));
        assert_eq!(status.pending, 2);

        monitor.record_exit("test");
        let status = monitor.snapshot(false, 0);
        assert!(!status.subprocess_alive);
        assert_eq!(status.pid, None);
        assert_eq!(status.uptime(), Duration::ZERO);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let monitor = HealthMonitor::new(RestartPolicy::default());
        let value = serde_json::to_value(monitor.snapshot(false, 0)).unwrap();
        assert!(value.get("bridgeConnected").is_some());
        assert!(value.get("recentErrors").is_some());
        assert!(value.get("consecutiveTimeouts").is_some());
    }
}
