//! Kiosk peripheral protocol engine.
//!
//! Bill acceptors (CCNet, ID003, SSP, ccTalk) and fiscal printers (Shtrih-M)
//! behind one execution model: a data-driven frame codec, a per-device
//! session that owns the serial line, a lifecycle state machine, escrow
//! bookkeeping and chunked firmware transfer. Hosts configure devices with a
//! JSON map and receive typed events over a channel.

pub mod config;
pub mod device;
pub mod error;
pub mod logging;

pub use config::{DeviceConfig, FeatureFlags};
pub use device::command::CommandId;
pub use device::ledger::{Denomination, EscrowEvent, EscrowState};
pub use device::status::{StatusCode, StatusCodeSet, StatusLevel};
pub use device::{Device, DeviceEvent, DeviceManager, DeviceState};
pub use error::{CommandError, ConfigError, ErrorCategory};
pub use logging::init_logging;
