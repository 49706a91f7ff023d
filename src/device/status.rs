//! Normalized device status codes and the per-protocol status decoders.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Severity bucket of a status code. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Ok,
    Warning,
    Busy,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Enabled,
    Disabled,
    PowerUp,
    Initializing,
    Busy,
    NotAvailable,
    Unknown,

    // Bill acceptors
    Accepting,
    Escrow,
    Stacking,
    Stacked,
    Returning,
    Returned,
    Rejected,
    Holding,
    Paused,
    StackerFull,
    StackerOpen,
    ValidatorJam,
    StackerJam,
    Cheated,
    Failure,

    // Printers
    PaperEnd,
    PaperNearEnd,
    CoverOpen,
    Printing,
    DocumentOpened,
    SessionOpened,
    SessionClosed,
    SessionExpired,
    PrinterError,
}

impl StatusCode {
    pub fn level(self) -> StatusLevel {
        match self {
            Self::Ok
            | Self::Enabled
            | Self::Stacked
            | Self::Returned
            | Self::SessionOpened
            | Self::SessionClosed => StatusLevel::Ok,
            Self::Disabled
            | Self::Unknown
            | Self::Rejected
            | Self::Paused
            | Self::PaperNearEnd
            | Self::DocumentOpened
            | Self::SessionExpired => StatusLevel::Warning,
            Self::PowerUp
            | Self::Initializing
            | Self::Busy
            | Self::Accepting
            | Self::Escrow
            | Self::Stacking
            | Self::Returning
            | Self::Holding
            | Self::Printing => StatusLevel::Busy,
            Self::NotAvailable
            | Self::StackerFull
            | Self::StackerOpen
            | Self::ValidatorJam
            | Self::StackerJam
            | Self::Cheated
            | Self::Failure
            | Self::PaperEnd
            | Self::CoverOpen
            | Self::PrinterError => StatusLevel::Error,
        }
    }
}

/// Normalized result of one status poll.
///
/// A set never reports nothing: decoding no codes yields `{Ok}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodeSet {
    codes: BTreeSet<StatusCode>,
    /// Extra data byte attached to a code (escrow index, failure reason).
    details: BTreeMap<StatusCode, u8>,
}

impl StatusCodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok() -> Self {
        Self::single(StatusCode::Ok)
    }

    pub fn not_available() -> Self {
        Self::single(StatusCode::NotAvailable)
    }

    pub fn single(code: StatusCode) -> Self {
        let mut set = Self::new();
        set.insert(code);
        set
    }

    pub fn insert(&mut self, code: StatusCode) {
        self.codes.insert(code);
    }

    pub fn insert_with(&mut self, code: StatusCode, detail: u8) {
        self.codes.insert(code);
        self.details.insert(code, detail);
    }

    pub fn contains(&self, code: StatusCode) -> bool {
        self.codes.contains(&code)
    }

    pub fn detail(&self, code: StatusCode) -> Option<u8> {
        self.details.get(&code).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = StatusCode> + '_ {
        self.codes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Most severe level present.
    pub fn level(&self) -> StatusLevel {
        self.codes
            .iter()
            .map(|c| c.level())
            .max()
            .unwrap_or(StatusLevel::Ok)
    }

    pub fn is_available(&self) -> bool {
        !self.contains(StatusCode::NotAvailable)
    }

    pub fn is_busy(&self) -> bool {
        self.codes.iter().any(|c| c.level() == StatusLevel::Busy)
    }

    fn normalized(mut self) -> Self {
        if self.codes.is_empty() {
            self.codes.insert(StatusCode::Ok);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

/// One raw status byte in a byte-coded answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    pub raw: u8,
    pub code: StatusCode,
    /// The next byte is data for this slot, not another status byte.
    pub extra: bool,
    /// Code to report instead when the extra byte is zero.
    pub zero_code: Option<StatusCode>,
    /// Stop interpreting the answer and report only this code.
    pub short_circuit: bool,
}

impl CodeEntry {
    pub const fn plain(raw: u8, code: StatusCode) -> Self {
        Self {
            raw,
            code,
            extra: false,
            zero_code: None,
            short_circuit: false,
        }
    }

    pub const fn with_data(raw: u8, code: StatusCode) -> Self {
        Self {
            raw,
            code,
            extra: true,
            zero_code: None,
            short_circuit: false,
        }
    }

    pub const fn or_when_zero(mut self, code: StatusCode) -> Self {
        self.zero_code = Some(code);
        self
    }

    pub const fn terminal(raw: u8, code: StatusCode) -> Self {
        Self {
            raw,
            code,
            extra: false,
            zero_code: None,
            short_circuit: true,
        }
    }
}

/// Masked comparison on one byte of a fixed-layout answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub byte: usize,
    pub mask: u8,
    pub value: u8,
    pub code: StatusCode,
    pub short_circuit: bool,
}

impl FieldRule {
    pub const fn new(byte: usize, mask: u8, value: u8, code: StatusCode) -> Self {
        Self {
            byte,
            mask,
            value,
            code,
            short_circuit: false,
        }
    }

    pub const fn terminal(mut self) -> Self {
        self.short_circuit = true;
        self
    }

    fn matches(&self, payload: &[u8]) -> bool {
        payload
            .get(self.byte)
            .is_some_and(|b| b & self.mask == self.value)
    }
}

/// How a protocol's status answer maps to status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLayout {
    /// Sequence of status bytes, some followed by a data byte.
    CodeStream { entries: Vec<CodeEntry> },
    /// Fixed-position fields tested against masks.
    Fields { min_len: usize, rules: Vec<FieldRule> },
    /// Event counter followed by (A, B) result pairs, newest first. A non-zero
    /// A is a denomination index: B = 1 means held in escrow, B = 0 stacked.
    /// A zero A means B is looked up in `results`.
    EventLog { results: Vec<(u8, StatusCode)> },
}

/// Decoder memory carried between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeState {
    pub last_event: Option<u8>,
}

const EVENT_LOG_PAIRS: usize = 5;

impl StatusLayout {
    pub fn decode(
        &self,
        payload: &[u8],
        state: &mut DecodeState,
    ) -> Result<StatusCodeSet, FrameError> {
        let set = match self {
            Self::CodeStream { entries } => decode_stream(entries, payload)?,
            Self::Fields { min_len, rules } => decode_fields(*min_len, rules, payload)?,
            Self::EventLog { results } => decode_event_log(results, payload, state)?,
        };
        Ok(set.normalized())
    }
}

fn decode_stream(entries: &[CodeEntry], payload: &[u8]) -> Result<StatusCodeSet, FrameError> {
    let mut set = StatusCodeSet::new();
    let mut i = 0;
    while i < payload.len() {
        let raw = payload[i];
        i += 1;
        let Some(entry) = entries.iter().find(|e| e.raw == raw) else {
            debug!("Unmapped status byte 0x{raw:02X}");
            set.insert_with(StatusCode::Unknown, raw);
            continue;
        };
        if entry.short_circuit {
            return Ok(StatusCodeSet::single(entry.code));
        }
        if entry.extra {
            let data = *payload.get(i).ok_or_else(|| {
                FrameError::Malformed(format!("status 0x{raw:02X} is missing its data byte"))
            })?;
            i += 1;
            match entry.zero_code {
                Some(code) if data == 0 => set.insert(code),
                _ => set.insert_with(entry.code, data),
            }
        } else {
            set.insert(entry.code);
        }
    }
    Ok(set)
}

fn decode_fields(
    min_len: usize,
    rules: &[FieldRule],
    payload: &[u8],
) -> Result<StatusCodeSet, FrameError> {
    if payload.len() < min_len {
        return Err(FrameError::Malformed(format!(
            "status answer has {} bytes, expected at least {min_len}",
            payload.len()
        )));
    }
    let mut set = StatusCodeSet::new();
    for rule in rules.iter().filter(|r| r.matches(payload)) {
        if rule.short_circuit {
            return Ok(StatusCodeSet::single(rule.code));
        }
        set.insert(rule.code);
    }
    Ok(set)
}

fn decode_event_log(
    results: &[(u8, StatusCode)],
    payload: &[u8],
    state: &mut DecodeState,
) -> Result<StatusCodeSet, FrameError> {
    let (&counter, pairs) = payload
        .split_first()
        .ok_or_else(|| FrameError::Malformed("empty event log".into()))?;
    if pairs.len() % 2 != 0 {
        return Err(FrameError::Malformed(format!(
            "event log has an odd number of result bytes ({})",
            pairs.len()
        )));
    }

    let previous = state.last_event.replace(counter);
    if counter == 0 {
        return Ok(StatusCodeSet::single(StatusCode::PowerUp));
    }
    let Some(previous) = previous else {
        return Ok(StatusCodeSet::new());
    };

    // The counter wraps from 255 to 1, skipping 0.
    let fresh = if counter >= previous {
        (counter - previous) as usize
    } else {
        counter as usize + 255 - previous as usize
    };
    let available = (pairs.len() / 2).min(EVENT_LOG_PAIRS);
    if fresh > available {
        debug!("Event log overflow: {fresh} new events, {available} readable");
    }

    let mut set = StatusCodeSet::new();
    for slot in (0..fresh.min(available)).rev() {
        let a = pairs[slot * 2];
        let b = pairs[slot * 2 + 1];
        match (a, b) {
            (0, result) => match results.iter().find(|(raw, _)| *raw == result) {
                Some((_, code)) => set.insert(*code),
                None => set.insert_with(StatusCode::Unknown, result),
            },
            (index, 1) => set.insert_with(StatusCode::Escrow, index),
            (index, _) => set.insert_with(StatusCode::Stacked, index),
        }
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
