use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::SyncError, retry::ReconnectPolicy, types::ConnectionState};

/// Close code of a deliberate, normal channel shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code used when the channel dropped or could not be opened.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Phase of one push-channel lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Open,
    Closed { code: u16 },
}

/// What the transport should do after a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Normal closure; stay idle until the caller reconnects.
    Idle,
    /// Reconnect after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    /// Too many consecutive abnormal closures; stop until `connect()`.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    phase: ChannelPhase,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: ChannelPhase::Idle,
            attempts: 0,
            policy,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Consecutive abnormal closures since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.phase {
            ChannelPhase::Connecting => ConnectionState::Connecting,
            ChannelPhase::Open => ConnectionState::Connected,
            ChannelPhase::Idle | ChannelPhase::Closed { .. } => ConnectionState::Disconnected,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.phase, ChannelPhase::Closed { .. })
            && !self.policy.allows_reconnect(self.attempts)
    }

    /// Forget previous failures; used when the caller explicitly reconnects.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    pub fn begin_connect(&mut self) -> Result<(), SyncError> {
        match self.phase {
            ChannelPhase::Idle | ChannelPhase::Closed { .. } => {
                self.phase = ChannelPhase::Connecting;
                Ok(())
            }
            current => Err(SyncError::invalid_state(current, "begin_connect")),
        }
    }

    pub fn on_open(&mut self) -> Result<(), SyncError> {
        if self.phase != ChannelPhase::Connecting {
            return Err(SyncError::invalid_state(self.phase, "on_open"));
        }
        self.phase = ChannelPhase::Open;
        self.attempts = 0;
        Ok(())
    }

    /// Record a closure (or failed open) and decide whether to reconnect.
    pub fn on_close(&mut self, code: u16) -> CloseDecision {
        if code == NORMAL_CLOSURE {
            self.phase = ChannelPhase::Idle;
            return CloseDecision::Idle;
        }

        self.phase = ChannelPhase::Closed { code };
        self.attempts = self.attempts.saturating_add(1);
        if self.policy.allows_reconnect(self.attempts) {
            CloseDecision::Reconnect {
                attempt: self.attempts,
                delay: self.policy.delay_for_attempt(self.attempts),
            }
        } else {
            CloseDecision::Exhausted {
                attempts: self.attempts,
            }
        }
    }

    /// Caller-initiated shutdown; never schedules a reconnect.
    pub fn on_manual_close(&mut self) {
        self.phase = ChannelPhase::Idle;
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
