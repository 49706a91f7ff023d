//! Command identifiers and the per-protocol command table.

use crate::error::CommandError;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Protocol-independent command identifiers.
///
/// Each descriptor maps the ids it supports to wire codes; an id that a
/// protocol does not register fails with `CommandError::UnknownCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    Reset,
    Poll,
    Identify,
    GetStatus,
    Sync,

    // Bill acceptors
    GetBillTable,
    GetBillId,
    EnableBillTypes,
    SetInhibits,
    SetSecurity,
    Stack,
    Return,
    Hold,
    SetupRequest,
    EnableDevice,
    DisableDevice,
    CurrencyAssign,
    SetCommunicationMode,

    // Fiscal printers
    GetLongStatus,
    CancelDocument,
    ZReport,
    XReport,
    ContinuePrint,
    PrintLine,

    // Firmware transfer
    FirmwareSetBaud,
    FirmwareHead,
    FirmwareBlock,
    FirmwareExit,
}

impl CommandId {
    /// Commands a host may send while a note sits in escrow.
    pub fn allowed_during_escrow(self) -> bool {
        matches!(
            self,
            Self::Poll | Self::GetStatus | Self::Stack | Self::Return | Self::Hold | Self::Sync
        )
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shape of a successful answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// A data frame.
    Data,
    /// A bare acknowledgement.
    Ack,
    /// Nothing is read back.
    NoAnswer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub code: Vec<u8>,
    pub timeout: Duration,
    pub retryable: bool,
    pub answer: AnswerKind,
    /// Operator credentials are prepended to the data.
    pub service: bool,
}

impl Command {
    pub fn answer(&mut self, kind: AnswerKind) -> &mut Self {
        self.answer = kind;
        self
    }

    pub fn service(&mut self) -> &mut Self {
        self.service = true;
        self
    }
}

/// Immutable catalog of the commands one protocol understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTable {
    commands: BTreeMap<CommandId, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a command. Defaults to a data answer.
    pub fn register(
        &mut self,
        id: CommandId,
        code: &[u8],
        timeout_ms: u64,
        retryable: bool,
    ) -> &mut Command {
        let command = Command {
            id,
            code: code.to_vec(),
            timeout: Duration::from_millis(timeout_ms),
            retryable,
            answer: AnswerKind::Data,
            service: false,
        };
        match self.commands.entry(id) {
            Entry::Occupied(mut slot) => {
                slot.insert(command);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(command),
        }
    }

    pub fn get(&self, id: CommandId) -> Result<&Command, CommandError> {
        self.commands
            .get(&id)
            .ok_or_else(|| CommandError::UnknownCommand(id.to_string()))
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.commands.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
