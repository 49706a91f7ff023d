//! Device protocol engine.
//!
//! Drives banknote acceptors and fiscal printers over serial links. Every
//! vendor protocol is a `ProtocolDescriptor` (framing, commands, error and
//! status tables) executed by one `DeviceSession`; a `Device` adds the
//! lifecycle state machine, the denomination ledger, firmware transfer and
//! background polling, and the `DeviceManager` keeps devices by id.

pub mod classifier;
pub mod codec;
pub mod command;
pub mod driver;
pub mod firmware;
pub mod fiscal;
pub mod ledger;
pub mod manager;
pub mod poller;
pub mod protocol;
pub mod protocols;
pub mod session;
pub mod state;
pub mod status;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use driver::{Device, DeviceEvent};
pub use fiscal::{FiscalPrinter, FiscalSessionState};
pub use manager::{DeviceManager, DeviceSummary};
pub use state::DeviceState;
