//! Device session: the single execution path for every command.
//!
//! A session owns the transport and the codec of one device behind a mutex.
//! `exclusive` hands out a `Link` for the lifetime of the lock, so a
//! multi-command sequence (remediation, firmware transfer) cannot be
//! interleaved with anyone else's command. At most one frame exchange is on
//! the wire at any time.

use super::classifier::{Classification, Remediation, RemediationStep};
use super::codec::{FrameCodec, Handshake};
use super::command::{AnswerKind, Command, CommandId};
use super::protocol::{Outcome, ProtocolDescriptor, ResponseRule};
use super::status::{DecodeState, StatusCode, StatusCodeSet};
use super::transport::{PortSettings, Transport};
use crate::config::DeviceConfig;
use crate::error::{CommandError, FrameError, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra attempts for a retryable command after a transport-level failure.
pub const TRANSPORT_RETRIES: usize = 2;

const REMEDIATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Observability record of the last exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRecord {
    pub last_error: Option<String>,
    pub last_error_code: Option<u8>,
    pub last_command: Option<CommandId>,
    /// Remediations currently running, outermost first.
    pub remediation_stack: Vec<Remediation>,
    pub exchanges: u64,
    pub retries: u64,
    pub remediations: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Site-specific knobs of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Prepended to the data of service commands (operator password).
    pub service_data: Vec<u8>,
    /// Allow closing an expired fiscal day without asking.
    pub auto_close_session: bool,
}

impl SessionOptions {
    pub fn from_config(descriptor: &ProtocolDescriptor, config: &DeviceConfig) -> Self {
        Self {
            service_data: descriptor.service_data(config.operator_password),
            auto_close_session: config.features.auto_z_report,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    rx: Vec<u8>,
    diagnostics: DiagnosticRecord,
    status_state: DecodeState,
}

pub struct DeviceSession {
    descriptor: &'static ProtocolDescriptor,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
    cancel: Mutex<CancellationToken>,
}

impl DeviceSession {
    pub fn new(
        descriptor: &'static ProtocolDescriptor,
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        Self {
            descriptor,
            options,
            inner: Mutex::new(SessionInner {
                transport,
                codec: FrameCodec::new(descriptor.codec.clone()),
                rx: Vec::new(),
                diagnostics: DiagnosticRecord::default(),
                status_state: DecodeState::default(),
            }),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.descriptor
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` while holding the session exclusively.
    pub fn exclusive<R>(&self, f: impl FnOnce(&mut Link<'_>) -> R) -> R {
        let mut guard = self.lock();
        let mut link = Link {
            session: self,
            inner: &mut *guard,
        };
        f(&mut link)
    }

    pub fn open(&self) -> Result<(), CommandError> {
        let mut inner = self.lock();
        if inner.transport.is_open() {
            return Ok(());
        }
        inner.transport.open()?;
        inner.rx.clear();
        inner.status_state = DecodeState::default();
        info!(
            "[{}] Session opened on {}",
            self.descriptor.name,
            inner.transport.description()
        );
        Ok(())
    }

    pub fn close(&self) -> Result<(), CommandError> {
        let mut inner = self.lock();
        inner.rx.clear();
        inner.transport.close()?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock().transport.is_open()
    }

    /// Execute one command, remediating a recoverable device error once.
    pub fn execute(&self, id: CommandId, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        self.exclusive(|link| link.execute(id, data))
    }

    /// Apply `settings` for the duration of `f`; the prior settings are
    /// restored afterwards whatever `f` returns.
    pub fn with_port_settings<R>(
        &self,
        settings: PortSettings,
        f: impl FnOnce(&mut Link<'_>) -> Result<R, CommandError>,
    ) -> Result<R, CommandError> {
        self.exclusive(|link| link.with_port_settings(settings, f))
    }

    pub fn diagnostics(&self) -> DiagnosticRecord {
        self.lock().diagnostics.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ask the command in flight to stop at its next retry boundary.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    /// Replace a cancelled token so the session accepts commands again.
    pub fn renew_cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

enum ReadFailure {
    Frame(FrameError),
    Transport(TransportError),
}

impl From<ReadFailure> for CommandError {
    fn from(e: ReadFailure) -> Self {
        match e {
            ReadFailure::Frame(e) => e.into(),
            ReadFailure::Transport(e) => e.into(),
        }
    }
}

/// Exclusive access to a session's wire, valid while the lock is held.
pub struct Link<'a> {
    session: &'a DeviceSession,
    inner: &'a mut SessionInner,
}

impl Link<'_> {
    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.session.descriptor
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    pub fn port_settings(&self) -> PortSettings {
        self.inner.transport.settings()
    }

    pub fn configure(&mut self, settings: PortSettings) -> Result<(), CommandError> {
        self.inner.transport.configure(settings)?;
        self.inner.rx.clear();
        Ok(())
    }

    pub fn with_port_settings<R>(
        &mut self,
        settings: PortSettings,
        f: impl FnOnce(&mut Link<'_>) -> Result<R, CommandError>,
    ) -> Result<R, CommandError> {
        let prior = self.port_settings();
        self.configure(settings)?;
        let result = f(self);
        let restored = self.configure(prior);
        let value = result?;
        restored?;
        Ok(value)
    }

    pub fn decode_status(&mut self, payload: &[u8]) -> Result<StatusCodeSet, CommandError> {
        let descriptor = self.session.descriptor;
        Ok(descriptor.status.decode(payload, &mut self.inner.status_state)?)
    }

    /// Issue the protocol's status command and decode the answer.
    pub fn poll_status(&mut self) -> Result<StatusCodeSet, CommandError> {
        let payload = self.execute(self.session.descriptor.status_command, &[])?;
        self.decode_status(&payload)
    }

    /// Execute with one remediation attempt for recoverable device errors.
    pub fn execute(&mut self, id: CommandId, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        let (code, description) = match self.execute_plain(id, data) {
            Err(CommandError::Device { code, description }) => (code, description),
            other => return other,
        };
        let original = CommandError::Device { code, description };

        let remediation = match self.session.descriptor.errors.classify(id, code) {
            Classification::Recoverable(r) => r,
            _ => return Err(original),
        };
        if !self.may_remediate(remediation) {
            debug!("Remediation {remediation:?} for 0x{code:02X} skipped");
            return Err(original);
        }

        info!(
            command = %id,
            "Device error 0x{code:02X}, running {remediation:?} before re-issuing"
        );
        self.inner.diagnostics.remediation_stack.push(remediation);
        self.inner.diagnostics.remediations += 1;

        let result = match self.remediate(remediation) {
            Ok(()) => self.execute_plain(id, data),
            Err(e) => {
                warn!("Remediation {remediation:?} failed: {e}");
                Err(original)
            }
        };
        self.inner.diagnostics.remediation_stack.pop();
        result
    }

    /// Execute without any remediation.
    pub fn execute_plain(&mut self, id: CommandId, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        let command = self.session.descriptor.command(id)?;
        let result = self.transact(command, data);

        let diag = &mut self.inner.diagnostics;
        diag.exchanges += 1;
        diag.last_command = Some(id);
        diag.updated_at = Some(Utc::now());
        if let Err(e) = &result {
            diag.last_error = Some(e.to_string());
            diag.last_error_code = match e {
                CommandError::Device { code, .. } => Some(*code),
                _ => None,
            };
        }
        result
    }

    fn may_remediate(&self, remediation: Remediation) -> bool {
        !self.inner.diagnostics.remediation_stack.contains(&remediation)
            && (!remediation.needs_auto_close() || self.session.options.auto_close_session)
    }

    fn remediate(&mut self, remediation: Remediation) -> Result<(), CommandError> {
        let descriptor = self.session.descriptor;
        let steps = descriptor.remediation.steps(remediation).ok_or_else(|| {
            CommandError::Configuration(format!("no plan for {remediation:?}"))
        })?;

        for step in steps {
            match step {
                RemediationStep::Send(id) => {
                    self.execute_plain(*id, &[])?;
                }
                RemediationStep::WaitWhile { code, timeout_ms } => {
                    self.wait_while(*code, *timeout_ms)?;
                }
                RemediationStep::ResolveMode => {
                    let probe = descriptor.remediation.mode_probe.as_ref().ok_or_else(|| {
                        CommandError::Configuration("no mode probe".into())
                    })?;
                    let answer = self.execute_plain(probe.command, &[])?;
                    let next = probe.resolve(&answer).ok_or_else(|| {
                        CommandError::Protocol(format!(
                            "no remediation for mode {:02X?}",
                            answer.get(probe.byte)
                        ))
                    })?;
                    if next == Remediation::ResolveMode || !self.may_remediate(next) {
                        return Err(CommandError::Protocol(format!(
                            "mode resolves to {next:?}, which cannot run now"
                        )));
                    }
                    debug!("Mode resolved to {next:?}");
                    self.inner.diagnostics.remediation_stack.push(next);
                    let nested = self.remediate(next);
                    self.inner.diagnostics.remediation_stack.pop();
                    nested?;
                }
            }
        }
        Ok(())
    }

    fn wait_while(&mut self, code: StatusCode, timeout_ms: u64) -> Result<(), CommandError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let status_command = self.session.descriptor.status_command;
        loop {
            let payload = self.execute_plain(status_command, &[])?;
            if !self.decode_status(&payload)?.contains(code) {
                return Ok(());
            }
            if Instant::now() >= deadline || self.is_cancelled() {
                return Err(CommandError::WaitTimeout(timeout_ms));
            }
            std::thread::sleep(REMEDIATION_POLL_INTERVAL);
        }
    }

    // -----------------------------------------------------------------------
    // Exchange
    // -----------------------------------------------------------------------

    fn transact(&mut self, command: &Command, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        let mut payload = Vec::with_capacity(data.len() + 4);
        if command.service {
            payload.extend_from_slice(&self.session.options.service_data);
        }
        payload.extend_from_slice(data);

        if command.id == CommandId::Sync {
            self.inner.codec.reset_sequence();
        } else {
            self.inner.codec.next_sequence();
        }
        let frame = self.inner.codec.encode(&command.code, &payload)?;

        let attempts = if command.retryable {
            1 + TRANSPORT_RETRIES
        } else {
            1
        };
        let mut last = CommandError::Transport("no attempt made".into());
        for attempt in 0..attempts {
            if self.is_cancelled() {
                return Err(CommandError::Cancelled);
            }
            if attempt > 0 {
                self.inner.diagnostics.retries += 1;
                warn!(
                    command = %command.id,
                    "Retrying after transport error ({}/{}): {last}",
                    attempt,
                    TRANSPORT_RETRIES
                );
            }
            match self.attempt(command, &frame) {
                Ok(answer) => return Ok(answer),
                Err(e) if e.is_transport() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn attempt(&mut self, command: &Command, frame: &[u8]) -> Result<Vec<u8>, CommandError> {
        let descriptor = self.session.descriptor;
        let handshake = descriptor.codec.handshake;

        // A late answer to an earlier command must not be read as ours.
        self.inner.transport.clear_input()?;
        self.inner.rx.clear();

        debug!(
            protocol = descriptor.name,
            command = %command.id,
            "TX {:02X?}",
            frame
        );
        self.write_frame(frame, command.timeout)?;
        if let Some(hs) = handshake {
            self.await_ack(command, frame, hs)?;
        }
        if command.answer == AnswerKind::NoAnswer {
            return Ok(Vec::new());
        }

        let payload = match self.read_frame(command.timeout) {
            Ok(p) => p,
            Err(ReadFailure::Frame(
                e @ (FrameError::ChecksumMismatch { .. } | FrameError::LengthMismatch { .. }),
            )) if handshake.is_some() => {
                let nak = handshake.map(|h| h.nak).unwrap_or_default();
                warn!(command = %command.id, "Bad answer frame ({e}), sending NAK");
                self.inner.transport.write(&[nak])?;
                self.read_frame(command.timeout)?
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(hs) = handshake {
            self.inner.transport.write(&[hs.ack])?;
        }
        debug!(
            protocol = descriptor.name,
            command = %command.id,
            "RX {:02X?}",
            payload
        );

        self.interpret(command, payload)
    }

    /// Read a frame the device sends on its own, as the answer to `id`.
    pub fn receive(&mut self, id: CommandId) -> Result<Vec<u8>, CommandError> {
        let descriptor = self.session.descriptor;
        let command = descriptor.command(id)?;
        let payload = self.read_frame(command.timeout)?;
        if let Some(hs) = descriptor.codec.handshake {
            self.inner.transport.write(&[hs.ack])?;
        }
        debug!(
            protocol = descriptor.name,
            command = %command.id,
            "RX unsolicited {:02X?}",
            payload
        );
        self.interpret(command, payload)
    }

    fn interpret(&mut self, command: &Command, payload: Vec<u8>) -> Result<Vec<u8>, CommandError> {
        let descriptor = self.session.descriptor;
        let acknowledgement = is_acknowledgement(&descriptor.response, &payload);
        match descriptor
            .response
            .interpret(command, payload, &descriptor.errors)
        {
            Outcome::Data(answer) => {
                if let Some(confirm) = &descriptor.confirm {
                    if command.answer == AnswerKind::Data && !acknowledgement {
                        let ack = self.inner.codec.encode(confirm, &[])?;
                        self.write_frame(&ack, command.timeout)?;
                    }
                }
                Ok(answer)
            }
            Outcome::Nak => Err(CommandError::Transport(format!(
                "{} answered with NAK",
                command.id
            ))),
            Outcome::Protocol(msg) => Err(CommandError::Protocol(msg)),
            Outcome::DeviceError(code) => {
                let description = descriptor.errors.describe(code);
                Err(match descriptor.errors.classify(command.id, code) {
                    Classification::Transport => CommandError::Transport(description),
                    Classification::Protocol => CommandError::Protocol(description),
                    Classification::Device | Classification::Recoverable(_) => {
                        CommandError::Device { code, description }
                    }
                })
            }
        }
    }

    /// Write a frame and swallow its local echo when the line has one.
    fn write_frame(&mut self, frame: &[u8], timeout: Duration) -> Result<(), CommandError> {
        self.inner.transport.write(frame)?;
        if !self.session.descriptor.codec.local_echo {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while self.inner.rx.len() < frame.len() {
            if !self.fill(deadline)? {
                return Err(FrameError::Timeout.into());
            }
        }
        if self.inner.rx[..frame.len()] != *frame {
            let actual = self.inner.rx[..frame.len()].to_vec();
            self.inner.rx.clear();
            return Err(FrameError::EchoMismatch {
                expected: frame.to_vec(),
                actual,
            }
            .into());
        }
        self.inner.rx.drain(..frame.len());
        Ok(())
    }

    /// Wait for the handshake ACK, retransmitting once on NAK or silence.
    fn await_ack(
        &mut self,
        command: &Command,
        frame: &[u8],
        hs: Handshake,
    ) -> Result<(), CommandError> {
        for round in 0..2 {
            if round > 0 {
                warn!(command = %command.id, "Frame not acknowledged, retransmitting");
                self.inner.rx.clear();
                self.write_frame(frame, command.timeout)?;
            }
            let deadline = Instant::now() + command.timeout;
            match self.next_byte(deadline)? {
                Some(b) if b == hs.ack => return Ok(()),
                Some(b) if b == hs.nak => debug!("NAK for {}", command.id),
                Some(b) => debug!("Garbled acknowledgement 0x{b:02X} for {}", command.id),
                None => debug!("No acknowledgement for {}", command.id),
            }
        }
        Err(CommandError::Transport(format!(
            "{} not acknowledged after retransmission",
            command.id
        )))
    }

    /// Read one more chunk into the receive buffer. `false` on timeout.
    fn fill(&mut self, deadline: Instant) -> Result<bool, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        match self.inner.transport.read(remaining) {
            Ok(bytes) => {
                self.inner.rx.extend_from_slice(&bytes);
                Ok(true)
            }
            Err(TransportError::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn next_byte(&mut self, deadline: Instant) -> Result<Option<u8>, TransportError> {
        if self.inner.rx.is_empty() && !self.fill(deadline)? {
            return Ok(None);
        }
        if self.inner.rx.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.inner.rx.remove(0)))
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, ReadFailure> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.codec.extract(&self.inner.rx) {
                Ok(Some((payload, consumed))) => {
                    self.inner.rx.drain(..consumed);
                    return Ok(payload);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Discarding {:02X?}: {e}", self.inner.rx);
                    self.inner.rx.clear();
                    return Err(ReadFailure::Frame(e));
                }
            }
            match self.fill(deadline) {
                Ok(true) => {}
                Ok(false) => return Err(ReadFailure::Frame(FrameError::Timeout)),
                Err(e) => return Err(ReadFailure::Transport(e)),
            }
        }
    }
}

fn is_acknowledgement(rule: &ResponseRule, payload: &[u8]) -> bool {
    match *rule {
        ResponseRule::AckNak { ack, nak } => {
            payload == [ack] || nak.is_some_and(|n| payload == [n])
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
