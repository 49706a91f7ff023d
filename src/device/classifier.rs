//! Vendor error codes: descriptions, propagation category and remediation.

use super::command::CommandId;
use super::status::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Corrective action run once before a failed command is re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    CancelDocument,
    /// Close the fiscal day with a Z-report.
    CloseSession,
    ContinuePrinting,
    WaitForPrinting,
    /// Read the device mode and pick one of the other remediations.
    ResolveMode,
}

impl Remediation {
    /// Closing the fiscal day is only done when the site allows it.
    pub fn needs_auto_close(self) -> bool {
        self == Self::CloseSession
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Recoverable(Remediation),
    Device,
    Protocol,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: u8,
    pub description: String,
    pub classification: Classification,
    /// Commands for which the remediation must not be attempted.
    pub exempt: BTreeSet<CommandId>,
}

impl ErrorEntry {
    pub fn remediate(&mut self, remediation: Remediation) -> &mut Self {
        self.classification = Classification::Recoverable(remediation);
        self
    }

    pub fn protocol(&mut self) -> &mut Self {
        self.classification = Classification::Protocol;
        self
    }

    pub fn transport(&mut self) -> &mut Self {
        self.classification = Classification::Transport;
        self
    }

    pub fn except(&mut self, command: CommandId) -> &mut Self {
        self.exempt.insert(command);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorTable {
    entries: BTreeMap<u8, ErrorEntry>,
}

impl ErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device error. Entries default to the Device category.
    pub fn insert(&mut self, code: u8, description: &str) -> &mut ErrorEntry {
        let entry = ErrorEntry {
            code,
            description: description.to_string(),
            classification: Classification::Device,
            exempt: BTreeSet::new(),
        };
        match self.entries.entry(code) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    pub fn contains(&self, code: u8) -> bool {
        self.entries.contains_key(&code)
    }

    pub fn describe(&self, code: u8) -> String {
        self.entries
            .get(&code)
            .map(|e| e.description.clone())
            .unwrap_or_else(|| format!("unknown error 0x{code:02X}"))
    }

    pub fn classify(&self, command: CommandId, code: u8) -> Classification {
        match self.entries.get(&code) {
            None => Classification::Device,
            Some(entry) => match entry.classification {
                Classification::Recoverable(_) if entry.exempt.contains(&command) => {
                    Classification::Device
                }
                other => other,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Remediation plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationStep {
    Send(CommandId),
    /// Poll status until `code` clears.
    WaitWhile { code: StatusCode, timeout_ms: u64 },
    /// Read the mode byte and run the remediation mapped to it.
    ResolveMode,
}

/// Where the device reports its operating mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeProbe {
    pub command: CommandId,
    pub byte: usize,
    pub mask: u8,
    pub modes: Vec<(u8, Remediation)>,
}

impl ModeProbe {
    pub fn resolve(&self, answer: &[u8]) -> Option<Remediation> {
        let mode = answer.get(self.byte)? & self.mask;
        self.modes
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, r)| *r)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationPlans {
    plans: BTreeMap<Remediation, Vec<RemediationStep>>,
    pub mode_probe: Option<ModeProbe>,
}

impl RemediationPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(mut self, remediation: Remediation, steps: Vec<RemediationStep>) -> Self {
        self.plans.insert(remediation, steps);
        self
    }

    pub fn with_mode_probe(mut self, probe: ModeProbe) -> Self {
        self.mode_probe = Some(probe);
        self
    }

    pub fn steps(&self, remediation: Remediation) -> Option<&[RemediationStep]> {
        self.plans.get(&remediation).map(|s| s.as_slice())
    }
}
