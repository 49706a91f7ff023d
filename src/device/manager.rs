//! Device Manager: lifecycle orchestrator for every configured peripheral.
//!
//! Devices are registered under a host-supplied id (or a generated one) and
//! addressed by that id afterwards. The map lock is only held to look a
//! handle up; device I/O runs outside it.

use super::command::CommandId;
use super::driver::{Device, DeviceEvent};
use super::protocol::Identification;
use super::state::DeviceState;
use super::status::StatusCodeSet;
use super::transport::Transport;
use crate::config::DeviceConfig;
use crate::error::CommandError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use uuid::Uuid;

/// Snapshot of one managed device for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub id: String,
    pub protocol: String,
    pub state: DeviceState,
    pub connected: bool,
    pub ready: bool,
    pub model: Option<Identification>,
    pub last_status: Option<StatusCodeSet>,
}

/// Central manager for all connected devices.
pub struct DeviceManager {
    devices: Mutex<HashMap<String, Device>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Device>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle of a managed device.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.lock().get(device_id).cloned()
    }

    fn require(&self, device_id: &str) -> Result<Device, CommandError> {
        self.device(device_id)
            .ok_or_else(|| CommandError::NotConnected(device_id.to_string()))
    }

    /// Open the serial port named in `config` and bring the device up.
    ///
    /// Returns the device id and its event stream. A device that opened but
    /// failed identification or initialisation stays registered in
    /// `ErrorState` so the host can inspect and reset it; the failure is
    /// still returned.
    pub fn connect_device(
        &self,
        device_id: Option<&str>,
        config: DeviceConfig,
    ) -> Result<(String, UnboundedReceiver<DeviceEvent>), CommandError> {
        let id = device_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.disconnect_device(&id);
        let (device, events) = Device::from_config(&id, config)?;
        self.register(id, device, events)
    }

    /// Same as `connect_device` on an already built transport.
    pub fn connect_with_transport(
        &self,
        device_id: &str,
        config: DeviceConfig,
        transport: Box<dyn Transport>,
    ) -> Result<(String, UnboundedReceiver<DeviceEvent>), CommandError> {
        self.disconnect_device(device_id);
        let (device, events) = Device::new(device_id, config, transport)?;
        self.register(device_id.to_string(), device, events)
    }

    fn register(
        &self,
        id: String,
        device: Device,
        events: UnboundedReceiver<DeviceEvent>,
    ) -> Result<(String, UnboundedReceiver<DeviceEvent>), CommandError> {
        let protocol = device.descriptor().name;
        let result = device.connect();
        if !device.is_connected() {
            warn!("Device {id} failed to connect ({protocol})");
            return Err(result.err().unwrap_or_else(|| {
                CommandError::NotConnected(id.clone())
            }));
        }

        self.lock().insert(id.clone(), device);
        match result {
            Ok(()) => {
                info!("Device {id} connected ({protocol})");
                Ok((id, events))
            }
            Err(e) => {
                warn!("Device {id} connected degraded ({protocol}): {e}");
                Err(e)
            }
        }
    }

    /// Shut a device down and remove it. Unknown ids are ignored.
    pub fn disconnect_device(&self, device_id: &str) {
        let removed = self.lock().remove(device_id);
        if let Some(device) = removed {
            device.shutdown();
            info!("Device {device_id} disconnected");
        }
    }

    /// Current status of a device. Unknown devices are not available.
    pub fn status(&self, device_id: &str) -> StatusCodeSet {
        match self.device(device_id) {
            Some(device) => device.status(),
            None => StatusCodeSet::not_available(),
        }
    }

    pub fn summary(&self, device_id: &str) -> Option<DeviceSummary> {
        self.device(device_id).map(|d| DeviceSummary {
            id: d.id().to_string(),
            protocol: d.descriptor().name.to_string(),
            state: d.state(),
            connected: d.is_connected(),
            ready: d.is_ready(),
            model: d.model(),
            last_status: d.last_status(),
        })
    }

    /// Execute a command on a managed device.
    pub fn execute(
        &self,
        device_id: &str,
        command: CommandId,
        data: &[u8],
    ) -> Result<Vec<u8>, CommandError> {
        self.require(device_id)?.execute(command, data)
    }

    pub fn reset(&self, device_id: &str) -> Result<(), CommandError> {
        self.require(device_id)?.reset()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.device(device_id).is_some_and(|d| d.is_connected())
    }

    pub fn connected_device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Disconnect every device (host shutdown).
    pub fn shutdown(&self) {
        let devices: Vec<(String, Device)> = self.lock().drain().collect();
        for (_, device) in &devices {
            device.shutdown();
        }
        info!(
            "DeviceManager shutdown: {} devices disconnected",
            devices.len()
        );
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
