//! Transport layer for device communication.
//!
//! Defines the `Transport` trait the session drives and the serial
//! implementation built on the `serialport` crate.

use crate::config::DeviceConfig;
use crate::error::{ConfigError, TransportError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Port settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Line parameters of a serial link. Data bits are always 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl PortSettings {
    /// 8N1 without flow control.
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }

    pub const fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub const fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self::new(9600)
    }
}

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Open,
    Error,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Raw byte channel to one device.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Write all bytes. Returns the number written.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Return whatever arrives within `timeout` (at least one byte), or
    /// `TransportError::Timeout` when nothing does.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Apply new line settings. Takes effect immediately on an open port
    /// and on the next open otherwise.
    fn configure(&mut self, settings: PortSettings) -> Result<(), TransportError>;

    fn settings(&self) -> PortSettings;

    /// Drop everything waiting in the input buffer.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn state(&self) -> TransportState;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Serial (COM / RS-232 / USB-serial) transport.
pub struct SerialTransport {
    port_name: String,
    settings: PortSettings,
    port: Option<Box<dyn serialport::SerialPort>>,
    state: TransportState,
}

impl SerialTransport {
    pub fn new(port_name: &str, settings: PortSettings) -> Self {
        Self {
            port_name: port_name.to_string(),
            settings,
            port: None,
            state: TransportState::Closed,
        }
    }

    fn apply(port: &mut dyn serialport::SerialPort, s: &PortSettings) -> serialport::Result<()> {
        port.set_baud_rate(s.baud_rate)?;
        port.set_parity(to_serial_parity(s.parity))?;
        port.set_stop_bits(to_serial_stop_bits(s.stop_bits))?;
        port.set_flow_control(to_serial_flow(s.flow_control))?;
        Ok(())
    }
}

fn to_serial_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serial_stop_bits(s: StopBits) -> serialport::StopBits {
    match s {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn to_serial_flow(f: FlowControl) -> serialport::FlowControl {
    match f {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        info!(
            "Opening serial port {} @ {} baud",
            self.port_name, self.settings.baud_rate
        );

        let port = serialport::new(&self.port_name, self.settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(to_serial_parity(self.settings.parity))
            .stop_bits(to_serial_stop_bits(self.settings.stop_bits))
            .flow_control(to_serial_flow(self.settings.flow_control))
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                self.state = TransportState::Error;
                TransportError::Port(format!("failed to open {}: {e}", self.port_name))
            })?;

        self.port = Some(port);
        self.state = TransportState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.port = None;
        self.state = TransportState::Closed;
        info!("Serial port {} closed", self.port_name);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        debug!("Serial TX ({} bytes): {:02X?}", data.len(), data);
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let timeout_ms = timeout.as_millis() as u64;
        port.set_timeout(timeout.max(Duration::from_millis(1)))?;

        let mut buf = vec![0u8; 512];
        match port.read(&mut buf) {
            Ok(0) => Err(TransportError::Timeout(timeout_ms)),
            Ok(n) => {
                buf.truncate(n);
                debug!("Serial RX ({n} bytes): {:02X?}", &buf);
                Ok(buf)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(TransportError::Timeout(timeout_ms))
            }
            Err(e) => {
                self.state = TransportState::Error;
                Err(TransportError::Io(format!("serial read: {e}")))
            }
        }
    }

    fn configure(&mut self, settings: PortSettings) -> Result<(), TransportError> {
        if let Some(port) = self.port.as_mut() {
            Self::apply(port.as_mut(), &settings)?;
        }
        debug!(
            "Serial port {} configured: {:?}",
            self.port_name, settings
        );
        self.settings = settings;
        Ok(())
    }

    fn settings(&self) -> PortSettings {
        self.settings
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == TransportState::Open && self.port.is_some()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        format!("Serial({}@{})", self.port_name, self.settings.baud_rate)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Create the serial transport described by a device configuration.
///
/// `defaults` are the protocol's line settings; a configured baud rate
/// overrides the default speed.
pub fn create_transport(
    config: &DeviceConfig,
    defaults: PortSettings,
) -> Result<Box<dyn Transport>, ConfigError> {
    let port = config
        .port
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or(ConfigError::Missing("port"))?;
    let settings = match config.baud_rate {
        Some(baud) => defaults.with_baud(baud),
        None => defaults,
    };
    Ok(Box::new(SerialTransport::new(port, settings)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
