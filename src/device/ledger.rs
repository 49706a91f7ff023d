//! Denomination table and escrow bookkeeping for bill acceptors.
//!
//! The table is loaded from the device once and only its enabled/inhibited
//! flags change afterwards. At most one escrow decision is outstanding at a
//! time; it always ends Stacked or Returned.

use super::command::CommandId;
use super::status::{StatusCode, StatusCodeSet};
use crate::error::CommandError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Resolved escrow events kept for diagnostics.
const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("denomination table is not loaded")]
    NotLoaded,

    #[error("unknown denomination index {0}")]
    UnknownIndex(u8),

    #[error("device reassigned denomination index {0}")]
    IndexReassigned(u8),

    #[error("escrow for index {0} is still outstanding")]
    EscrowOutstanding(u8),

    #[error("no escrow is outstanding")]
    NoEscrow,

    #[error("escrow can only resolve to Stacked or Returned")]
    NotTerminal,

    #[error("malformed denomination table: {0}")]
    Malformed(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl From<LedgerError> for CommandError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Command(e) => e,
            LedgerError::EscrowOutstanding(_) => Self::EscrowPending,
            LedgerError::NoEscrow => Self::NoEscrow,
            other => Self::Configuration(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Denomination {
    pub index: u8,
    pub nominal: f64,
    pub currency: String,
    pub enabled: bool,
    pub inhibited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Presented,
    Stacked,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowEvent {
    pub index: u8,
    pub nominal: f64,
    pub currency: String,
    pub state: EscrowState,
    pub presented_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Escrow transition produced by a status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    Presented(EscrowEvent),
    Resolved(EscrowEvent),
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrencyRule {
    /// Three ASCII letters starting at `at`.
    Ascii { at: usize },
    /// One code byte at `at` resolved through a table.
    Lookup { at: usize, table: Vec<(u8, &'static str)> },
}

impl CurrencyRule {
    fn resolve(&self, record: &[u8]) -> String {
        match self {
            Self::Ascii { at } => record
                .get(*at..*at + 3)
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default(),
            Self::Lookup { at, table } => {
                let code = record.get(*at).copied().unwrap_or(0);
                table
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map(|(_, name)| name.to_string())
                    .unwrap_or_else(|| format!("#{code:02X}"))
            }
        }
    }
}

/// How a protocol reports its denomination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParTableLayout {
    /// One answer holding fixed-size records.
    Records {
        command: CommandId,
        record_size: usize,
        first_index: u8,
        /// Byte holding the record's own index; positional otherwise.
        index_at: Option<usize>,
        mantissa_at: usize,
        /// Bit 7 set means a negative exponent.
        exponent_at: usize,
        currency: CurrencyRule,
    },
    /// Setup answer listing channel values after a value multiplier.
    SspSetup { first_index: u8 },
    /// One request per channel answered with an ASCII id such as `EU0005A`.
    PerChannel {
        command: CommandId,
        channels: u8,
        first_index: u8,
        countries: Vec<(&'static str, &'static str)>,
    },
}

impl ParTableLayout {
    pub fn first_index(&self) -> u8 {
        match self {
            Self::Records { first_index, .. }
            | Self::SspSetup { first_index }
            | Self::PerChannel { first_index, .. } => *first_index,
        }
    }
}

/// How the enable/inhibit mask goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskEncoding {
    pub command: CommandId,
    pub min_channels: u8,
    pub big_endian: bool,
    /// A set bit means inhibited rather than enabled.
    pub inverted: bool,
    /// The mask is sent twice (enable + escrow enable).
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// Table parsing
// ---------------------------------------------------------------------------

fn nominal(mantissa: u8, exponent: u8) -> f64 {
    let power = (exponent & 0x7F) as i32;
    let power = if exponent & 0x80 != 0 { -power } else { power };
    mantissa as f64 * 10f64.powi(power)
}

fn parse_records(
    payload: &[u8],
    record_size: usize,
    first_index: u8,
    index_at: Option<usize>,
    mantissa_at: usize,
    exponent_at: usize,
    currency: &CurrencyRule,
) -> Result<Vec<(u8, f64, String)>, LedgerError> {
    if record_size == 0 || payload.len() % record_size != 0 {
        return Err(LedgerError::Malformed(format!(
            "{} bytes is not a whole number of {record_size}-byte records",
            payload.len()
        )));
    }
    let mut out = Vec::new();
    for (n, record) in payload.chunks_exact(record_size).enumerate() {
        let mantissa = record.get(mantissa_at).copied().unwrap_or(0);
        if mantissa == 0 {
            continue;
        }
        let index = match index_at {
            Some(at) => record.get(at).copied().unwrap_or(0),
            None => first_index.wrapping_add(n as u8),
        };
        let exponent = record.get(exponent_at).copied().unwrap_or(0);
        out.push((index, nominal(mantissa, exponent), currency.resolve(record)));
    }
    Ok(out)
}

fn parse_setup(payload: &[u8], first_index: u8) -> Result<Vec<(u8, f64, String)>, LedgerError> {
    let short = || LedgerError::Malformed(format!("setup answer too short ({} bytes)", payload.len()));
    let currency = payload
        .get(5..8)
        .map(|b| String::from_utf8_lossy(b).trim().to_string())
        .ok_or_else(short)?;
    let multiplier = payload
        .get(8..11)
        .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
        .ok_or_else(short)?
        .max(1);
    let channels = *payload.get(11).ok_or_else(short)? as usize;
    let values = payload.get(12..12 + channels).ok_or_else(short)?;

    Ok(values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0)
        .map(|(n, &v)| {
            (
                first_index.wrapping_add(n as u8),
                v as f64 * multiplier as f64,
                currency.clone(),
            )
        })
        .collect())
}

/// Parse a bill id such as `EU0005A`. Unassigned channels answer dots.
fn parse_bill_id(answer: &[u8], countries: &[(&str, &str)]) -> Option<(f64, String)> {
    let text = std::str::from_utf8(answer).ok()?.trim();
    if text.len() < 6 || text.starts_with('.') {
        return None;
    }
    let country = text.get(0..2)?;
    let value: u32 = text.get(2..6)?.parse().ok()?;
    if value == 0 {
        return None;
    }
    let currency = countries
        .iter()
        .find(|(c, _)| *c == country)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| country.to_string());
    Some((value as f64, currency))
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Ledger {
    denominations: BTreeMap<u8, Denomination>,
    first_index: u8,
    loaded: bool,
    escrow: Option<EscrowEvent>,
    history: VecDeque<EscrowEvent>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn denominations(&self) -> Vec<Denomination> {
        self.denominations.values().cloned().collect()
    }

    pub fn denomination(&self, index: u8) -> Option<&Denomination> {
        self.denominations.get(&index)
    }

    pub fn escrow(&self) -> Option<&EscrowEvent> {
        self.escrow.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &EscrowEvent> {
        self.history.iter()
    }

    /// Read the denomination table from the device.
    ///
    /// A second load only confirms the table: an index whose value or
    /// currency changed is an error and the stored table is left untouched.
    pub fn load_table<F>(&mut self, layout: &ParTableLayout, mut fetch: F) -> Result<usize, LedgerError>
    where
        F: FnMut(CommandId, &[u8]) -> Result<Vec<u8>, CommandError>,
    {
        let entries = match layout {
            ParTableLayout::Records {
                command,
                record_size,
                first_index,
                index_at,
                mantissa_at,
                exponent_at,
                currency,
            } => {
                let payload = fetch(*command, &[])?;
                parse_records(
                    &payload,
                    *record_size,
                    *first_index,
                    *index_at,
                    *mantissa_at,
                    *exponent_at,
                    currency,
                )?
            }
            ParTableLayout::SspSetup { first_index } => {
                let payload = fetch(CommandId::SetupRequest, &[])?;
                parse_setup(&payload, *first_index)?
            }
            ParTableLayout::PerChannel {
                command,
                channels,
                first_index,
                countries,
            } => {
                let mut out = Vec::new();
                for channel in *first_index..first_index.saturating_add(*channels) {
                    let answer = fetch(*command, &[channel])?;
                    if let Some((value, currency)) = parse_bill_id(&answer, countries) {
                        out.push((channel, value, currency));
                    }
                }
                out
            }
        };

        if self.loaded {
            for (index, value, currency) in &entries {
                if let Some(known) = self.denominations.get(index) {
                    if known.nominal != *value || known.currency != *currency {
                        return Err(LedgerError::IndexReassigned(*index));
                    }
                }
            }
            debug!("Denomination table re-read, {} entries unchanged", entries.len());
            return Ok(self.denominations.len());
        }

        for (index, value, currency) in entries {
            debug!("Denomination {index}: {value} {currency}");
            self.denominations.insert(
                index,
                Denomination {
                    index,
                    nominal: value,
                    currency,
                    enabled: false,
                    inhibited: false,
                },
            );
        }
        self.first_index = layout.first_index();
        self.loaded = true;
        info!("Loaded {} denominations", self.denominations.len());
        Ok(self.denominations.len())
    }

    pub fn set_inhibited(&mut self, index: u8, inhibited: bool) -> Result<(), LedgerError> {
        let d = self
            .denominations
            .get_mut(&index)
            .ok_or(LedgerError::UnknownIndex(index))?;
        d.inhibited = inhibited;
        Ok(())
    }

    /// Bit n is set for index `first_index + n` when it is enabled and not
    /// inhibited. The width covers the highest index and at least
    /// `min_channels` channels.
    pub fn build_mask(&self, encoding: &MaskEncoding, min_channels: u8) -> Vec<u8> {
        let highest = self
            .denominations
            .keys()
            .map(|&i| i.saturating_sub(self.first_index) as usize + 1)
            .max()
            .unwrap_or(0);
        let channels = highest
            .max(encoding.min_channels as usize)
            .max(min_channels as usize)
            .max(1);
        let mut mask = vec![0u8; channels.div_ceil(8)];

        for d in self.denominations.values() {
            if d.enabled && !d.inhibited && d.index >= self.first_index {
                let bit = (d.index - self.first_index) as usize;
                mask[bit / 8] |= 1 << (bit % 8);
            }
        }
        if encoding.inverted {
            mask.iter_mut().for_each(|b| *b = !*b);
        }
        if encoding.big_endian {
            mask.reverse();
        }
        if encoding.duplicate {
            mask.extend_from_within(..);
        }
        mask
    }

    /// Enable exactly `enabled` and send the mask. Flags are rolled back
    /// when the device refuses it.
    pub fn apply_enable_mask<F>(
        &mut self,
        enabled: &BTreeSet<u8>,
        encoding: &MaskEncoding,
        min_channels: u8,
        mut send: F,
    ) -> Result<Vec<u8>, LedgerError>
    where
        F: FnMut(CommandId, &[u8]) -> Result<Vec<u8>, CommandError>,
    {
        if !self.loaded {
            return Err(LedgerError::NotLoaded);
        }
        if let Some(&unknown) = enabled.iter().find(|i| !self.denominations.contains_key(*i)) {
            return Err(LedgerError::UnknownIndex(unknown));
        }

        let previous: Vec<(u8, bool)> = self
            .denominations
            .values()
            .map(|d| (d.index, d.enabled))
            .collect();
        for d in self.denominations.values_mut() {
            d.enabled = enabled.contains(&d.index);
        }

        let mask = self.build_mask(encoding, min_channels);
        debug!("Enable mask {:02X?}", mask);
        if let Err(e) = send(encoding.command, &mask) {
            for (index, was) in previous {
                if let Some(d) = self.denominations.get_mut(&index) {
                    d.enabled = was;
                }
            }
            return Err(e.into());
        }
        Ok(mask)
    }

    /// Record a note entering escrow. Repeating the outstanding index is a
    /// no-op.
    pub fn present(&mut self, index: u8) -> Result<EscrowEvent, LedgerError> {
        if let Some(current) = &self.escrow {
            if current.index == index {
                return Ok(current.clone());
            }
            return Err(LedgerError::EscrowOutstanding(current.index));
        }
        let (nominal, currency) = match self.denominations.get(&index) {
            Some(d) => (d.nominal, d.currency.clone()),
            None => {
                warn!("Escrow reports unknown denomination index {index}");
                (0.0, String::new())
            }
        };
        let event = EscrowEvent {
            index,
            nominal,
            currency,
            state: EscrowState::Presented,
            presented_at: Utc::now(),
            resolved_at: None,
        };
        info!("Escrow presented: index {index}, {nominal} {}", event.currency);
        self.escrow = Some(event.clone());
        Ok(event)
    }

    pub fn resolve(&mut self, state: EscrowState) -> Result<EscrowEvent, LedgerError> {
        if state == EscrowState::Presented {
            return Err(LedgerError::NotTerminal);
        }
        let mut event = self.escrow.take().ok_or(LedgerError::NoEscrow)?;
        event.state = state;
        event.resolved_at = Some(Utc::now());
        info!("Escrow resolved: index {} {:?}", event.index, state);

        self.history.push_back(event.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        Ok(event)
    }

    /// Drop an outstanding escrow after the device was reset. The note is
    /// returned by the hardware on reset.
    pub fn abandon_escrow(&mut self) -> Option<EscrowEvent> {
        if self.escrow.is_none() {
            return None;
        }
        self.resolve(EscrowState::Returned).ok()
    }

    /// Feed a decoded status into the escrow state.
    pub fn apply_status(&mut self, status: &StatusCodeSet) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        let resolution = if status.contains(StatusCode::Stacked) {
            Some((EscrowState::Stacked, status.detail(StatusCode::Stacked)))
        } else if status.contains(StatusCode::Returned) {
            Some((EscrowState::Returned, status.detail(StatusCode::Returned)))
        } else if status.contains(StatusCode::Rejected) {
            // its detail is a rejection reason, not a note
            Some((EscrowState::Returned, None))
        } else {
            None
        };
        let presented = if status.contains(StatusCode::Escrow) {
            status.detail(StatusCode::Escrow)
        } else {
            None
        };

        if let Some(current) = self.escrow.as_ref().map(|e| e.index) {
            match resolution {
                Some((state, Some(reported))) if reported != current => {
                    warn!("Device reports note {reported} {state:?} while {current} is in escrow");
                }
                Some((state, _)) => {
                    if let Ok(event) = self.resolve(state) {
                        events.push(LedgerEvent::Resolved(event));
                    }
                }
                None => {}
            }
            if let Some(index) = presented {
                if self.escrow.is_none() {
                    if let Ok(event) = self.present(index) {
                        events.push(LedgerEvent::Presented(event));
                    }
                } else if self.escrow.as_ref().is_some_and(|e| e.index != index) {
                    warn!("Device reports escrow {index} while another is outstanding");
                }
            }
        } else if let Some(index) = presented {
            if let Ok(event) = self.present(index) {
                events.push(LedgerEvent::Presented(event));
            }
            // escrowed and settled between two polls
            if let Some((state, detail)) = resolution {
                if detail == Some(index) {
                    if let Ok(event) = self.resolve(state) {
                        events.push(LedgerEvent::Resolved(event));
                    }
                }
            }
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
