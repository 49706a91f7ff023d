//! Error types shared across the device engine.
//!
//! Errors are grouped the way callers need to react to them: transport
//! faults are retried, protocol faults are surfaced immediately, device
//! error codes go through the error classifier, and configuration problems
//! mark a device as degraded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors raised by a byte transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("port is not open")]
    NotOpen,

    #[error("read timed out after {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serial port error: {0}")]
    Port(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout(0),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        Self::Port(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Frame errors
// ---------------------------------------------------------------------------

/// Errors raised while building or parsing a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("checksum mismatch: computed {expected:04X}, received {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("no complete frame before timeout")]
    Timeout,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("echo mismatch: expected {expected:02X?}, got {actual:02X?}")]
    EchoMismatch { expected: Vec<u8>, actual: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

/// Propagation category of a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Device,
    Configuration,
}

/// Result of a failed command execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("device error 0x{code:02X}: {description}")]
    Device { code: u8, description: String },

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("command {0} is not supported by this protocol")]
    UnknownCommand(String),

    #[error("command cancelled")]
    Cancelled,

    #[error("an escrow decision is outstanding")]
    EscrowPending,

    #[error("no escrow is outstanding")]
    NoEscrow,

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("condition not met within {0} ms")]
    WaitTimeout(u64),
}

impl CommandError {
    /// Category used to decide retry and surfacing behaviour.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Cancelled | Self::WaitTimeout(_) => ErrorCategory::Transport,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Device { .. } | Self::EscrowPending | Self::NoEscrow | Self::NotReady(_) => {
                ErrorCategory::Device
            }
            Self::Configuration(_) | Self::UnknownCommand(_) | Self::NotConnected(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<TransportError> for CommandError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<FrameError> for CommandError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::ChecksumMismatch { .. }
            | FrameError::LengthMismatch { .. }
            | FrameError::Timeout => Self::Transport(e.to_string()),
            FrameError::Malformed(_) | FrameError::EchoMismatch { .. } => {
                Self::Protocol(e.to_string())
            }
        }
    }
}

impl From<ConfigError> for CommandError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors raised while reading the device configuration map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing '{0}' in device configuration")]
    Missing(&'static str),

    #[error("invalid '{key}' in device configuration: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unsupported protocol '{0}'")]
    UnknownProtocol(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
