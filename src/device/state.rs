//! Device lifecycle state machine.
//!
//! ```text
//! Disconnected -> Identifying -> Verified | Unverified -> Initializing -> Ready <-> Busy
//!                      ^                                        |           |
//!                      |                                        v           v
//!                      +------------------ reset ----------- ErrorState <---+
//! ```
//!
//! `ErrorState` is left only through an explicit reset; nothing moves a
//! device from there to `Ready` directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Identifying,
    Verified,
    Unverified,
    Initializing,
    Ready,
    Busy,
    ErrorState,
}

impl DeviceState {
    /// Connected and accepting operational commands.
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happened to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Port opened and the connectivity probe answered.
    Connected,
    /// Identification answer matched (or did not match) the model table.
    Identified { verified: bool },
    /// Defaults are about to be applied.
    InitStarted,
    InitSucceeded,
    InitFailed,
    /// A command went out, or the device reported a busy status.
    Busy,
    /// The command finished, or the device reported it is idle again.
    Idle,
    /// The device reported itself unavailable.
    Unavailable,
    /// Unrecoverable device or protocol error.
    Fault,
    /// Explicit reset requested by the caller.
    Reset,
    /// Port closed.
    Disconnected,
}

/// A state change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: DeviceState,
    pub to: DeviceState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: DeviceState,
    since: DateTime<Utc>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Disconnected,
            since: Utc::now(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    fn target(&self, trigger: Trigger) -> Option<DeviceState> {
        use DeviceState::*;

        match (self.state, trigger) {
            (_, Trigger::Disconnected) => Some(Disconnected),
            (Disconnected, Trigger::Connected) => Some(Identifying),
            (Identifying, Trigger::Identified { verified: true }) => Some(Verified),
            (Identifying, Trigger::Identified { verified: false }) => Some(Unverified),
            (Identifying, Trigger::Fault) => Some(ErrorState),
            (Verified | Unverified, Trigger::InitStarted) => Some(Initializing),
            (Initializing, Trigger::InitSucceeded) => Some(Ready),
            (Initializing, Trigger::InitFailed | Trigger::Fault) => Some(ErrorState),
            (Ready, Trigger::Busy) => Some(Busy),
            (Busy, Trigger::Idle) => Some(Ready),
            (Ready | Busy, Trigger::Unavailable | Trigger::Fault) => Some(ErrorState),
            (Disconnected, Trigger::Reset) => None,
            (_, Trigger::Reset) => Some(Identifying),
            _ => None,
        }
    }

    /// Apply `trigger`. Returns the transition, or `None` when the trigger
    /// does not apply in the current state.
    pub fn fire(&mut self, trigger: Trigger) -> Option<Transition> {
        let to = match self.target(trigger) {
            Some(to) if to != self.state => to,
            _ => {
                debug!("State {} ignores {:?}", self.state, trigger);
                return None;
            }
        };
        let transition = Transition {
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.since = transition.at;
        Some(transition)
    }
}
