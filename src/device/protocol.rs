//! Protocol descriptors.
//!
//! A `ProtocolDescriptor` is plain data: framing rules, command table,
//! answer interpretation, error and status tables, the model table and the
//! acceptor layouts. One device session runs any protocol by reading its
//! descriptor; vendor differences never become separate session types.

use super::classifier::{ErrorTable, RemediationPlans};
use super::codec::CodecRules;
use super::command::{AnswerKind, Command, CommandId, CommandTable};
use super::firmware::FirmwareProfile;
use super::ledger::{MaskEncoding, ParTableLayout};
use super::status::StatusLayout;
use super::transport::PortSettings;
use crate::error::CommandError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    BillAcceptor,
    FiscalPrinter,
}

// ---------------------------------------------------------------------------
// Answer interpretation
// ---------------------------------------------------------------------------

/// How a decoded answer payload is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseRule {
    /// Single-byte ACK/NAK answers; other single bytes found in the error
    /// table are device errors; anything else is data.
    AckNak { ack: u8, nak: Option<u8> },
    /// First byte is a result code; data follows it.
    ResultCode { ok: u8, nak: Option<u8> },
    /// First byte echoes the command, second is the error code, data follows.
    EchoAndError,
}

/// What an answer means for the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Data(Vec<u8>),
    /// The device asks for a retransmission.
    Nak,
    DeviceError(u8),
    Protocol(String),
}

impl ResponseRule {
    pub fn interpret(&self, command: &Command, payload: Vec<u8>, errors: &ErrorTable) -> Outcome {
        match *self {
            Self::AckNak { ack, nak } => {
                if let [byte] = payload[..] {
                    if Some(byte) == nak {
                        return Outcome::Nak;
                    }
                    if byte == ack {
                        return Outcome::Data(Vec::new());
                    }
                    if errors.contains(byte) {
                        return Outcome::DeviceError(byte);
                    }
                }
                if command.answer == AnswerKind::Ack {
                    return Outcome::Protocol(format!(
                        "{} expects an acknowledgement, got {:02X?}",
                        command.id, payload
                    ));
                }
                Outcome::Data(payload)
            }
            Self::ResultCode { ok, nak } => match payload.split_first() {
                None => Outcome::Protocol(format!("{} answered an empty frame", command.id)),
                Some((&code, _)) if Some(code) == nak => Outcome::Nak,
                Some((&code, rest)) if code == ok => Outcome::Data(rest.to_vec()),
                Some((&code, _)) => Outcome::DeviceError(code),
            },
            Self::EchoAndError => {
                if payload.len() < 2 {
                    return Outcome::Protocol(format!(
                        "{} answer too short: {:02X?}",
                        command.id, payload
                    ));
                }
                if command.code.first() != Some(&payload[0]) {
                    return Outcome::Protocol(format!(
                        "answer echoes command 0x{:02X}, sent {:02X?}",
                        payload[0], command.code
                    ));
                }
                match payload[1] {
                    0 => Outcome::Data(payload[2..].to_vec()),
                    code => Outcome::DeviceError(code),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelPattern {
    Prefix(&'static str),
    Contains(&'static str),
    /// Raw identification byte at a fixed offset.
    Code { at: usize, value: u8 },
}

impl ModelPattern {
    fn matches(&self, name: &str, answer: &[u8]) -> bool {
        match self {
            Self::Prefix(p) => name.starts_with(p),
            Self::Contains(p) => name.contains(p),
            Self::Code { at, value } => answer.get(*at) == Some(value),
        }
    }
}

/// Per-model capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Enable masks are padded to at least this many channels.
    pub min_channels: u8,
    pub firmware_update: bool,
    /// Line speed used during firmware transfer.
    pub update_baud: Option<u32>,
    /// The model can hold a note in escrow on request.
    pub escrow_hold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: &'static str,
    pub pattern: ModelPattern,
    pub caps: Capabilities,
}

impl ModelEntry {
    pub fn new(name: &'static str, pattern: ModelPattern) -> Self {
        Self {
            name,
            pattern,
            caps: Capabilities::default(),
        }
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTable {
    pub entries: Vec<ModelEntry>,
    /// Unmatched devices may still run in degraded mode.
    pub allow_unverified: bool,
    /// Offset of the printable model name inside the identification answer.
    pub name_at: usize,
    pub name_len: Option<usize>,
}

/// Result of matching an identification answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub model: String,
    pub verified: bool,
    pub caps: Capabilities,
}

impl ModelTable {
    fn name_of(&self, answer: &[u8]) -> String {
        let tail = answer.get(self.name_at..).unwrap_or(&[]);
        let raw = match self.name_len {
            Some(len) => &tail[..len.min(tail.len())],
            None => tail,
        };
        raw.iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Match an answer against the table. An unmatched answer borrows the
    /// capabilities of the hinted model, if any, but stays unverified.
    pub fn identify(&self, answer: &[u8], hint: Option<&str>) -> Identification {
        let name = self.name_of(answer);
        if let Some(entry) = self.entries.iter().find(|e| e.pattern.matches(&name, answer)) {
            return Identification {
                model: if name.is_empty() { entry.name.to_string() } else { name },
                verified: true,
                caps: entry.caps,
            };
        }

        let hinted = hint.and_then(|h| self.entries.iter().find(|e| e.name.eq_ignore_ascii_case(h)));
        let model = match (name.is_empty(), hint) {
            (false, _) => name,
            (true, Some(h)) => h.to_string(),
            (true, None) => "unknown".to_string(),
        };
        Identification {
            model,
            verified: false,
            caps: hinted.map(|e| e.caps).unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// One command sent while bringing a device up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitStep {
    pub command: CommandId,
    pub data: Vec<u8>,
    /// A failure is logged and ignored.
    pub optional: bool,
}

impl InitStep {
    pub fn required(command: CommandId, data: &[u8]) -> Self {
        Self {
            command,
            data: data.to_vec(),
            optional: false,
        }
    }

    pub fn optional(command: CommandId, data: &[u8]) -> Self {
        Self {
            command,
            data: data.to_vec(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub kind: DeviceKind,
    pub port: PortSettings,
    pub codec: CodecRules,
    pub commands: CommandTable,
    pub response: ResponseRule,
    /// Payload the host sends back after every data answer.
    pub confirm: Option<Vec<u8>>,
    pub errors: ErrorTable,
    pub remediation: RemediationPlans,
    pub status_command: CommandId,
    pub status: StatusLayout,
    pub identify_command: CommandId,
    pub models: ModelTable,
    pub init: Vec<InitStep>,
    /// Sent after the enable mask to start accepting.
    pub enable: Option<InitStep>,
    pub par_table: Option<ParTableLayout>,
    pub mask: Option<MaskEncoding>,
    pub firmware: Option<FirmwareProfile>,
    /// Operator password used when the configuration has none.
    pub default_password: Option<u32>,
}

impl ProtocolDescriptor {
    pub fn command(&self, id: CommandId) -> Result<&Command, CommandError> {
        self.commands.get(id)
    }

    pub fn is_acceptor(&self) -> bool {
        self.kind == DeviceKind::BillAcceptor
    }

    /// Credentials prepended to service commands.
    pub fn service_data(&self, password: Option<u32>) -> Vec<u8> {
        password
            .or(self.default_password)
            .map(|p| p.to_le_bytes().to_vec())
            .unwrap_or_default()
    }
}
