//! Heartbeat state machine for mesh agents.
//!
//! Implements the dual-heartbeat protocol:
//! - Fast HEAD checks at the configured interval (lightweight)
//! - Full POST heartbeat only when topology changed or registration is due
//!
//! The machine also tracks registry-session transitions so the runtime can
//! emit connect/disconnect events exactly once per transition.

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::registry::FastHeartbeatStatus;

/// State of the heartbeat state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatState {
    /// Not yet registered with registry
    #[default]
    Unregistered,
    /// Registered and heartbeating normally
    Registered,
    /// Lost the registry session, retrying with backoff
    Reconnecting,
    /// Shutting down
    ShuttingDown,
}

/// Action to take based on heartbeat state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send full heartbeat/registration (POST)
    SendFull,
    /// Send fast heartbeat check (HEAD)
    SendFast,
    /// Wait for specified duration before next action
    Wait(Duration),
    /// Retry registration after backoff
    Retry { attempt: u32, backoff: Duration },
    /// No action needed (shutdown)
    None,
}

/// Registry-session transition observed while processing a heartbeat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// No session change
    None,
    /// The session was just established (first registration or recovery)
    Connected,
    /// The session was just lost
    Lost,
}

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats
    pub interval: Duration,
    /// Base backoff duration for reconnection retries
    pub base_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Consecutive failures before the session counts as lost
    pub missed_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            missed_threshold: 4,
        }
    }
}

/// Heartbeat state machine for managing agent registration and heartbeats.
pub struct HeartbeatStateMachine {
    state: HeartbeatState,
    config: HeartbeatConfig,
    last_heartbeat: Option<Instant>,
    consecutive_failures: u32,
    retry_attempt: u32,
    registered: bool,
    heartbeat_count: u64,
}

impl HeartbeatStateMachine {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            state: HeartbeatState::Unregistered,
            config,
            last_heartbeat: None,
            consecutive_failures: 0,
            retry_attempt: 0,
            registered: false,
            heartbeat_count: 0,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat_count
    }

    /// Determine the next action to take.
    pub fn next_action(&self) -> HeartbeatAction {
        match self.state {
            HeartbeatState::Unregistered => HeartbeatAction::SendFull,
            HeartbeatState::Registered => {
                if self.heartbeat_due() {
                    HeartbeatAction::SendFast
                } else {
                    HeartbeatAction::Wait(self.time_until_next_heartbeat())
                }
            }
            HeartbeatState::Reconnecting => HeartbeatAction::Retry {
                attempt: self.retry_attempt,
                backoff: self.calculate_backoff(),
            },
            HeartbeatState::ShuttingDown => HeartbeatAction::None,
        }
    }

    /// Process the result of a fast heartbeat check.
    ///
    /// Returns the follow-up action plus any session transition.
    pub fn on_fast_heartbeat_result(
        &mut self,
        status: FastHeartbeatStatus,
    ) -> (HeartbeatAction, SessionTransition) {
        trace!("Fast heartbeat result: {:?}", status);

        match status {
            FastHeartbeatStatus::NoChanges => {
                self.last_heartbeat = Some(Instant::now());
                self.consecutive_failures = 0;
                self.heartbeat_count += 1;
                (
                    HeartbeatAction::Wait(self.config.interval),
                    SessionTransition::None,
                )
            }
            FastHeartbeatStatus::TopologyChanged => {
                debug!("Topology changed, sending full heartbeat");
                (HeartbeatAction::SendFull, SessionTransition::None)
            }
            FastHeartbeatStatus::AgentUnknown => {
                warn!("Agent unknown to registry, re-registering");
                self.registered = false;
                self.state = HeartbeatState::Unregistered;
                (HeartbeatAction::SendFull, SessionTransition::None)
            }
            FastHeartbeatStatus::RegistryError | FastHeartbeatStatus::NetworkError => {
                self.consecutive_failures += 1;
                warn!(
                    "Fast heartbeat error ({:?}), failure count: {}",
                    status, self.consecutive_failures
                );

                let transition = self.maybe_lose_session();
                (HeartbeatAction::Wait(self.config.interval), transition)
            }
        }
    }

    /// Process a successful full heartbeat.
    pub fn on_full_heartbeat_success(&mut self) -> SessionTransition {
        debug!("Full heartbeat successful");

        let was_connected =
            self.registered && self.consecutive_failures < self.config.missed_threshold;

        self.last_heartbeat = Some(Instant::now());
        self.consecutive_failures = 0;
        self.retry_attempt = 0;
        self.registered = true;
        self.heartbeat_count += 1;
        self.state = HeartbeatState::Registered;

        if was_connected {
            SessionTransition::None
        } else {
            info!("Registry session established");
            SessionTransition::Connected
        }
    }

    /// Process a full heartbeat failure.
    pub fn on_full_heartbeat_failure(&mut self, error: &str) -> SessionTransition {
        warn!("Full heartbeat failed: {}", error);
        self.consecutive_failures += 1;
        self.retry_attempt += 1;
        self.maybe_lose_session()
    }

    /// Request shutdown.
    pub fn shutdown(&mut self) {
        info!("Heartbeat shutdown requested");
        self.state = HeartbeatState::ShuttingDown;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state == HeartbeatState::ShuttingDown
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    // Private helpers

    fn maybe_lose_session(&mut self) -> SessionTransition {
        if self.state != HeartbeatState::Reconnecting
            && self.consecutive_failures >= self.config.missed_threshold
        {
            self.state = HeartbeatState::Reconnecting;
            self.retry_attempt = 0;
            warn!("Registry session lost after {} failures", self.consecutive_failures);
            SessionTransition::Lost
        } else {
            SessionTransition::None
        }
    }

    fn heartbeat_due(&self) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() >= self.config.interval,
            None => true,
        }
    }

    fn time_until_next_heartbeat(&self) -> Duration {
        match self.last_heartbeat {
            Some(last) => {
                let elapsed = last.elapsed();
                if elapsed >= self.config.interval {
                    Duration::ZERO
                } else {
                    self.config.interval - elapsed
                }
            }
            None => Duration::ZERO,
        }
    }

    fn calculate_backoff(&self) -> Duration {
        // Exponential backoff, capped
        let base = self.config.base_backoff.as_millis() as u64;
        let factor = 2u64.saturating_pow(self.retry_attempt);
        let backoff_ms = base.saturating_mul(factor);
        let max_ms = self.config.max_backoff.as_millis() as u64;

        Duration::from_millis(backoff_ms.min(max_ms))
    }

    #[cfg(test)]
    fn force_retry_attempt(&mut self, attempt: u32) {
        self.retry_attempt = attempt;
    }
}
