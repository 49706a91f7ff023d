//! Device configuration.
//!
//! The host hands each device a JSON key-value map at construction time.
//! Keys follow the host's camelCase convention:
//!
//! ```json
//! {
//!   "protocol": "ccnet",
//!   "port": "/dev/ttyUSB0",
//!   "baudRate": 9600,
//!   "modelHint": "SM-2",
//!   "pollIntervalMs": 250,
//!   "enabledDenominations": [2, 3, 4],
//!   "features": { "allowUnverified": true, "autoZReport": false },
//!   "operatorPassword": 30
//! }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const MIN_POLL_INTERVAL_MS: u64 = 50;

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// Optional behaviours a site can switch on or off per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Keep operating when the identification answer matches no known model.
    pub allow_unverified: bool,
    /// Let the session close an expired fiscal day on its own.
    pub auto_z_report: bool,
    /// Permit firmware transfer even when the model table does not flag it.
    pub firmware_update: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            allow_unverified: true,
            auto_z_report: true,
            firmware_update: false,
        }
    }
}

impl FeatureFlags {
    fn from_value(value: Option<&Value>) -> Result<Self, ConfigError> {
        let mut flags = Self::default();
        let Some(value) = value else {
            return Ok(flags);
        };
        let map = value.as_object().ok_or(ConfigError::Invalid {
            key: "features",
            reason: "expected an object".into(),
        })?;
        for (name, flag) in map {
            let enabled = flag.as_bool().ok_or_else(|| ConfigError::Invalid {
                key: "features",
                reason: format!("flag '{name}' is not a boolean"),
            })?;
            match name.as_str() {
                "allowUnverified" => flags.allow_unverified = enabled,
                "autoZReport" => flags.auto_z_report = enabled,
                "firmwareUpdate" => flags.firmware_update = enabled,
                other => tracing::debug!("Ignoring unknown feature flag '{other}'"),
            }
        }
        Ok(flags)
    }
}

// ---------------------------------------------------------------------------
// Device configuration
// ---------------------------------------------------------------------------

/// Everything a device needs to know about its site at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub protocol: String,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub model_hint: Option<String>,
    pub poll_interval_ms: u64,
    /// Denomination indices to enable; `None` enables every loaded index.
    pub enabled_denominations: Option<BTreeSet<u8>>,
    pub features: FeatureFlags,
    pub operator_password: Option<u32>,
}

impl DeviceConfig {
    pub fn new(protocol: &str, port: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            port: Some(port.to_string()),
            baud_rate: None,
            model_hint: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            enabled_denominations: None,
            features: FeatureFlags::default(),
            operator_password: None,
        }
    }

    /// Read a configuration from the host's key-value map.
    pub fn from_value(config: &Value) -> Result<Self, ConfigError> {
        let protocol = config
            .get("protocol")
            .and_then(|v| v.as_str())
            .ok_or(ConfigError::Missing("protocol"))?
            .trim()
            .to_lowercase();
        if protocol.is_empty() {
            return Err(ConfigError::Invalid {
                key: "protocol",
                reason: "empty".into(),
            });
        }

        let port = config
            .get("port")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let baud_rate = match config.get("baudRate") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let baud = v.as_u64().ok_or(ConfigError::Invalid {
                    key: "baudRate",
                    reason: "expected a positive integer".into(),
                })?;
                Some(u32::try_from(baud).map_err(|_| ConfigError::Invalid {
                    key: "baudRate",
                    reason: format!("{baud} is out of range"),
                })?)
            }
        };

        let poll_interval_ms = config
            .get("pollIntervalMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(MIN_POLL_INTERVAL_MS);

        let enabled_denominations = match config.get("enabledDenominations") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let items = v.as_array().ok_or(ConfigError::Invalid {
                    key: "enabledDenominations",
                    reason: "expected an array of indices".into(),
                })?;
                let mut set = BTreeSet::new();
                for item in items {
                    let index = item
                        .as_u64()
                        .and_then(|i| u8::try_from(i).ok())
                        .ok_or_else(|| ConfigError::Invalid {
                            key: "enabledDenominations",
                            reason: format!("{item} is not a denomination index"),
                        })?;
                    set.insert(index);
                }
                Some(set)
            }
        };

        let operator_password = config
            .get("operatorPassword")
            .and_then(|v| v.as_u64())
            .and_then(|p| u32::try_from(p).ok());

        Ok(Self {
            protocol,
            port,
            baud_rate,
            model_hint: config
                .get("modelHint")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            poll_interval_ms,
            enabled_denominations,
            features: FeatureFlags::from_value(config.get("features"))?,
            operator_password,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
