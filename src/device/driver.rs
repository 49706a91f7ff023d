//! Device handle.
//!
//! A `Device` ties one session to its state machine, denomination ledger
//! and background poller. Everything the device reports is published as a
//! typed `DeviceEvent` on the channel handed out at construction.

use super::command::CommandId;
use super::firmware::{FirmwareError, FirmwareUpdater};
use super::ledger::{Denomination, EscrowEvent, EscrowState, Ledger, LedgerEvent};
use super::poller::{self, StatusSource};
use super::protocol::{Identification, ProtocolDescriptor};
use super::protocols;
use super::session::{DeviceSession, DiagnosticRecord, SessionOptions};
use super::state::{DeviceState, StateMachine, Transition, Trigger};
use super::status::StatusCodeSet;
use super::transport::{create_transport, Transport};
use crate::config::DeviceConfig;
use crate::error::{CommandError, ConfigError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `stack`/`reject` wait for the device to report the outcome.
const ESCROW_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a reset may take before the device must answer as ready.
const RESET_READY_TIMEOUT: Duration = Duration::from_secs(15);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    StateChanged { from: DeviceState, to: DeviceState },
    StatusChanged { status: StatusCodeSet },
    EscrowPresented { escrow: EscrowEvent },
    EscrowResolved { escrow: EscrowEvent },
    CommandCompleted { command: CommandId, success: bool },
    FirmwareProgress { done: usize, total: usize },
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct DeviceCore {
    id: String,
    config: DeviceConfig,
    session: DeviceSession,
    state: Mutex<StateMachine>,
    ledger: Mutex<Ledger>,
    model: Mutex<Option<Identification>>,
    last_status: Mutex<Option<StatusCodeSet>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    poller: Mutex<Option<PollTask>>,
}

impl DeviceCore {
    fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.session.descriptor()
    }

    fn emit(&self, event: DeviceEvent) {
        // a dropped receiver only means nobody is listening
        let _ = self.events.send(event);
    }

    fn state(&self) -> DeviceState {
        lock(&self.state).state()
    }

    fn fire(&self, trigger: Trigger) -> Option<Transition> {
        let transition = lock(&self.state).fire(trigger)?;
        info!(device = %self.id, "State {} -> {}", transition.from, transition.to);
        self.emit(DeviceEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
        Some(transition)
    }

    fn require_operational(&self) -> Result<(), CommandError> {
        match self.state() {
            DeviceState::Disconnected => Err(CommandError::NotConnected(self.id.clone())),
            s if s.is_operational() => Ok(()),
            s => Err(CommandError::NotReady(format!("device is {s}"))),
        }
    }

    fn escrow_outstanding(&self) -> bool {
        lock(&self.ledger).escrow().is_some()
    }

    /// The last status says the device is still working; only the next
    /// status may bring it back to `Ready`.
    fn reported_busy(&self) -> bool {
        lock(&self.last_status)
            .as_ref()
            .is_some_and(StatusCodeSet::is_busy)
    }

    /// Fold a decoded status into the ledger, the state machine and the
    /// event stream.
    fn process_status(&self, status: &StatusCodeSet) {
        let changed = {
            let mut last = lock(&self.last_status);
            if last.as_ref() == Some(status) {
                false
            } else {
                *last = Some(status.clone());
                true
            }
        };
        if changed {
            debug!(device = %self.id, "Status {:?}", status);
            self.emit(DeviceEvent::StatusChanged {
                status: status.clone(),
            });
        }

        if self.descriptor().is_acceptor() {
            let events = lock(&self.ledger).apply_status(status);
            for event in events {
                self.emit(match event {
                    LedgerEvent::Presented(escrow) => DeviceEvent::EscrowPresented { escrow },
                    LedgerEvent::Resolved(escrow) => DeviceEvent::EscrowResolved { escrow },
                });
            }
        }

        if !status.is_available() {
            self.fire(Trigger::Unavailable);
        } else if status.is_busy() {
            self.fire(Trigger::Busy);
        } else {
            self.fire(Trigger::Idle);
        }
    }

    /// Execute on behalf of a caller: the device must be operational and no
    /// escrow decision may be pending unless the command resolves it.
    fn dispatch(&self, id: CommandId, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        self.require_operational()?;
        if !id.allowed_during_escrow() && self.escrow_outstanding() {
            return Err(CommandError::EscrowPending);
        }

        self.fire(Trigger::Busy);
        let result = self.session.execute(id, data);
        match &result {
            Err(e @ (CommandError::Device { .. } | CommandError::Protocol(_))) => {
                warn!(device = %self.id, command = %id, "Command failed: {e}");
                self.fire(Trigger::Fault);
            }
            _ if self.reported_busy() => {}
            _ => {
                self.fire(Trigger::Idle);
            }
        }
        self.emit(DeviceEvent::CommandCompleted {
            command: id,
            success: result.is_ok(),
        });
        result
    }

    fn identify(&self) -> Result<Identification, CommandError> {
        let d = self.descriptor();
        let answer = self.session.execute(d.identify_command, &[])?;
        let identification = d
            .models
            .identify(&answer, self.config.model_hint.as_deref());
        info!(
            device = %self.id,
            "Identified model '{}' ({})",
            identification.model,
            if identification.verified { "verified" } else { "unverified" }
        );
        *lock(&self.model) = Some(identification.clone());
        Ok(identification)
    }

    /// Identifying -> Ready, or ErrorState on the way.
    fn bring_up(&self) -> Result<(), CommandError> {
        let identification = match self.identify() {
            Ok(i) => i,
            Err(e) => {
                self.fire(Trigger::Fault);
                return Err(e);
            }
        };
        let permitted =
            self.descriptor().models.allow_unverified && self.config.features.allow_unverified;
        if !identification.verified && !permitted {
            self.fire(Trigger::Fault);
            return Err(CommandError::Configuration(format!(
                "model '{}' is not supported",
                identification.model
            )));
        }
        self.fire(Trigger::Identified {
            verified: identification.verified,
        });

        self.fire(Trigger::InitStarted);
        match self.apply_defaults(&identification) {
            Ok(()) => {
                self.fire(Trigger::InitSucceeded);
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.id, "Applying defaults failed: {e}");
                self.fire(Trigger::InitFailed);
                Err(e)
            }
        }
    }

    fn apply_defaults(&self, identification: &Identification) -> Result<(), CommandError> {
        let d = self.descriptor();
        for step in &d.init {
            match self.session.execute(step.command, &step.data) {
                Ok(_) => {}
                Err(e) if step.optional => {
                    debug!("Optional init step {} failed: {e}", step.command)
                }
                Err(e) => return Err(e),
            }
        }

        if let (Some(layout), Some(encoding)) = (&d.par_table, &d.mask) {
            let mut ledger = lock(&self.ledger);
            ledger.load_table(layout, |id, data| self.session.execute(id, data))?;
            let enabled: BTreeSet<u8> = match &self.config.enabled_denominations {
                Some(set) => set.clone(),
                None => ledger.denominations().iter().map(|d| d.index).collect(),
            };
            ledger.apply_enable_mask(
                &enabled,
                encoding,
                identification.caps.min_channels,
                |id, data| self.session.execute(id, data),
            )?;
        }

        if let Some(step) = &d.enable {
            self.session.execute(step.command, &step.data)?;
        }
        Ok(())
    }

    fn min_channels(&self) -> u8 {
        lock(&self.model)
            .as_ref()
            .map(|m| m.caps.min_channels)
            .unwrap_or_default()
    }

    fn send_mask(&self, enabled: &BTreeSet<u8>) -> Result<Vec<u8>, CommandError> {
        let encoding = self
            .descriptor()
            .mask
            .as_ref()
            .ok_or_else(|| CommandError::Configuration("protocol has no enable mask".into()))?;
        let min_channels = self.min_channels();
        let mut ledger = lock(&self.ledger);
        Ok(ledger.apply_enable_mask(enabled, encoding, min_channels, |id, data| {
            self.session.execute(id, data)
        })?)
    }

    fn stop_polling(&self) {
        if let Some(task) = lock(&self.poller).take() {
            task.token.cancel();
            debug!(device = %self.id, "Poller stop requested");
        }
    }
}

impl StatusSource for DeviceCore {
    fn poll_once(&self) -> Result<StatusCodeSet, CommandError> {
        if self.state() == DeviceState::Disconnected {
            return Err(CommandError::NotConnected(self.id.clone()));
        }
        let status = self.session.poll_once()?;
        self.process_status(&status);
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to one device.
#[derive(Clone)]
pub struct Device {
    core: Arc<DeviceCore>,
}

impl Device {
    /// Build a device on an explicit transport.
    pub fn new(
        id: &str,
        config: DeviceConfig,
        transport: Box<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>), ConfigError> {
        let descriptor = protocols::find(&config.protocol)?;
        let options = SessionOptions::from_config(descriptor, &config);
        let (events, rx) = mpsc::unbounded_channel();
        let core = DeviceCore {
            id: id.to_string(),
            session: DeviceSession::new(descriptor, transport, options),
            config,
            state: Mutex::new(StateMachine::new()),
            ledger: Mutex::new(Ledger::new()),
            model: Mutex::new(None),
            last_status: Mutex::new(None),
            events,
            poller: Mutex::new(None),
        };
        Ok((Self { core: Arc::new(core) }, rx))
    }

    /// Build a device on the serial port named in its configuration.
    pub fn from_config(
        id: &str,
        config: DeviceConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>), ConfigError> {
        let descriptor = protocols::find(&config.protocol)?;
        let transport = create_transport(&config, descriptor.port)?;
        Self::new(id, config, transport)
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        self.core.descriptor()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.core.config
    }

    pub fn state(&self) -> DeviceState {
        self.core.state()
    }

    pub fn model(&self) -> Option<Identification> {
        lock(&self.core.model).clone()
    }

    pub fn diagnostics(&self) -> DiagnosticRecord {
        self.core.session.diagnostics()
    }

    pub fn last_status(&self) -> Option<StatusCodeSet> {
        lock(&self.core.last_status).clone()
    }

    pub fn denominations(&self) -> Vec<Denomination> {
        lock(&self.core.ledger).denominations()
    }

    pub fn escrow(&self) -> Option<EscrowEvent> {
        lock(&self.core.ledger).escrow().cloned()
    }

    pub fn escrow_history(&self) -> Vec<EscrowEvent> {
        lock(&self.core.ledger).history().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.core.session.is_open() && self.state() != DeviceState::Disconnected
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_operational()
    }

    /// Open the port, probe, identify and apply defaults.
    ///
    /// When identification or defaults fail the port stays open and the
    /// device is left in `ErrorState` until `reset`.
    pub fn connect(&self) -> Result<(), CommandError> {
        let core = &self.core;
        if core.state() != DeviceState::Disconnected {
            return Ok(());
        }
        core.session.renew_cancel();
        core.session.open()?;

        let probe = match core.session.poll_once() {
            Ok(status) => status,
            Err(e) => {
                warn!(device = %core.id, "Connectivity probe failed: {e}");
                if let Err(close) = core.session.close() {
                    debug!("Close after failed probe: {close}");
                }
                return Err(e);
            }
        };
        core.fire(Trigger::Connected);
        core.process_status(&probe);
        core.bring_up()
    }

    /// Re-read the identification answer. Allowed in `ErrorState`, but not
    /// while a note waits in escrow.
    pub fn identify(&self) -> Result<Identification, CommandError> {
        if self.state() == DeviceState::Disconnected {
            return Err(CommandError::NotConnected(self.core.id.clone()));
        }
        if self.core.escrow_outstanding() {
            return Err(CommandError::EscrowPending);
        }
        self.core.identify()
    }

    /// Poll once. A device that cannot be polled is reported as
    /// `NotAvailable`.
    pub fn status(&self) -> StatusCodeSet {
        match self.core.poll_once() {
            Ok(status) => status,
            Err(e) => {
                debug!(device = %self.core.id, "Status unavailable: {e}");
                StatusCodeSet::not_available()
            }
        }
    }

    pub fn execute(&self, id: CommandId, data: &[u8]) -> Result<Vec<u8>, CommandError> {
        self.core.dispatch(id, data)
    }

    /// Stack the note held in escrow.
    pub fn stack(&self) -> Result<EscrowEvent, CommandError> {
        self.settle(CommandId::Stack, EscrowState::Stacked)
    }

    /// Return the note held in escrow.
    pub fn reject(&self) -> Result<EscrowEvent, CommandError> {
        self.settle(CommandId::Return, EscrowState::Returned)
    }

    /// Keep the note in escrow past the hardware's own timeout, on models
    /// that support it. Call again before the extended timeout runs out.
    pub fn hold(&self) -> Result<(), CommandError> {
        let core = &self.core;
        core.require_operational()?;
        if !core.escrow_outstanding() {
            return Err(CommandError::NoEscrow);
        }
        let can_hold = lock(&core.model).as_ref().is_some_and(|m| m.caps.escrow_hold);
        if !can_hold {
            return Err(CommandError::Configuration(
                "model cannot hold a note in escrow".into(),
            ));
        }
        core.dispatch(CommandId::Hold, &[])?;
        debug!(device = %core.id, "Escrow hold extended");
        Ok(())
    }

    fn settle(&self, command: CommandId, requested: EscrowState) -> Result<EscrowEvent, CommandError> {
        let core = &self.core;
        core.require_operational()?;
        let pending = lock(&core.ledger)
            .escrow()
            .cloned()
            .ok_or(CommandError::NoEscrow)?;

        let answer = core.dispatch(command, &[])?;
        let d = core.descriptor();
        if d.command(command)?.code == d.command(d.status_command)?.code {
            // the command doubles as a poll; its answer is a status
            match core.session.exclusive(|link| link.decode_status(&answer)) {
                Ok(status) => core.process_status(&status),
                Err(e) => debug!("Answer to {command} is not a status: {e}"),
            }
        }

        if core.escrow_outstanding() {
            poller::wait_until_escrow_settled(&**core, ESCROW_SETTLE_TIMEOUT)?;
        }

        let resolved = {
            let mut ledger = lock(&core.ledger);
            match ledger.escrow() {
                // settled without reporting an outcome of its own
                Some(_) => Some(ledger.resolve(requested)?),
                None => None,
            }
        };
        if let Some(escrow) = resolved {
            core.emit(DeviceEvent::EscrowResolved {
                escrow: escrow.clone(),
            });
            return Ok(escrow);
        }

        lock(&core.ledger)
            .history()
            .filter(|e| e.index == pending.index)
            .last()
            .cloned()
            .ok_or(CommandError::NoEscrow)
    }

    /// Enable exactly `enabled`; every other denomination is refused.
    pub fn set_enabled_denominations(&self, enabled: &BTreeSet<u8>) -> Result<Vec<u8>, CommandError> {
        self.core.require_operational()?;
        if self.core.escrow_outstanding() {
            return Err(CommandError::EscrowPending);
        }
        self.core.send_mask(enabled)
    }

    /// Inhibit or release one denomination and resend the mask.
    pub fn set_inhibited(&self, index: u8, inhibited: bool) -> Result<Vec<u8>, CommandError> {
        self.core.require_operational()?;
        if self.core.escrow_outstanding() {
            return Err(CommandError::EscrowPending);
        }
        let enabled: BTreeSet<u8> = {
            let mut ledger = lock(&self.core.ledger);
            ledger.set_inhibited(index, inhibited)?;
            ledger
                .denominations()
                .into_iter()
                .filter(|d| d.enabled)
                .map(|d| d.index)
                .collect()
        };
        self.core.send_mask(&enabled)
    }

    /// Reset the device and bring it up again. The only way out of
    /// `ErrorState`.
    pub fn reset(&self) -> Result<(), CommandError> {
        let core = &self.core;
        if core.state() == DeviceState::Disconnected {
            return Err(CommandError::NotConnected(core.id.clone()));
        }
        core.session.renew_cancel();
        core.fire(Trigger::Reset);
        info!(device = %core.id, "Resetting");

        let d = core.descriptor();
        if d.commands.contains(CommandId::Reset) {
            if let Err(e) = core.session.execute(CommandId::Reset, &[]) {
                core.fire(Trigger::Fault);
                return Err(e);
            }
        }
        // the hardware returns a held note on reset
        if let Some(escrow) = lock(&core.ledger).abandon_escrow() {
            core.emit(DeviceEvent::EscrowResolved { escrow });
        }
        if d.commands.contains(CommandId::Reset) {
            if let Err(e) = poller::wait_until_ready(&**core, RESET_READY_TIMEOUT) {
                warn!(device = %core.id, "Device not ready after reset: {e}");
            }
        }
        core.bring_up()
    }

    /// Transfer a firmware image. The device is re-identified afterwards.
    pub fn update_firmware(&self, image: &[u8]) -> Result<(), FirmwareError> {
        let core = &self.core;
        let profile = core
            .descriptor()
            .firmware
            .as_ref()
            .ok_or(FirmwareError::Unsupported)?;
        // a device in ErrorState has to be reset first
        core.require_operational()?;
        let caps = lock(&core.model)
            .as_ref()
            .map(|m| m.caps)
            .unwrap_or_default();
        if !caps.firmware_update && !core.config.features.firmware_update {
            return Err(FirmwareError::Unsupported);
        }
        if core.escrow_outstanding() {
            return Err(CommandError::EscrowPending.into());
        }

        core.fire(Trigger::Busy);
        let mut updater = FirmwareUpdater::new(profile, caps.update_baud);
        let result = core.session.exclusive(|link| {
            updater.run(link, image, |done, total| {
                core.emit(DeviceEvent::FirmwareProgress { done, total })
            })
        });

        match result {
            Ok(()) => {
                core.fire(Trigger::Reset);
                if let Err(e) = poller::wait_until_ready(&**core, RESET_READY_TIMEOUT) {
                    warn!(device = %core.id, "Device not ready after firmware update: {e}");
                }
                if let Err(e) = core.bring_up() {
                    warn!(device = %core.id, "Re-initialisation after firmware update failed: {e}");
                }
                Ok(())
            }
            Err(e) => {
                error!(device = %core.id, "Firmware update failed: {e}");
                core.fire(Trigger::Fault);
                Err(e)
            }
        }
    }

    /// Poll the device every `interval` on a background task until
    /// `stop_polling` or `shutdown`. Must be called inside a tokio runtime.
    pub fn start_polling(&self, interval: Duration) -> Result<(), CommandError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CommandError::Configuration(format!("no async runtime: {e}")))?;
        self.core.stop_polling();

        let token = self.core.session.cancel_token().child_token();
        let task_token = token.clone();
        let core = Arc::clone(&self.core);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let polled = Arc::clone(&core);
                match tokio::task::spawn_blocking(move || polled.poll_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(CommandError::NotConnected(_))) => break,
                    Ok(Err(e)) => debug!(device = %core.id, "Background poll failed: {e}"),
                    Err(e) => {
                        error!(device = %core.id, "Background poll panicked: {e}");
                        break;
                    }
                }
            }
            debug!(device = %core.id, "Poller stopped");
        });

        info!(device = %self.core.id, "Polling every {} ms", interval.as_millis());
        *lock(&self.core.poller) = Some(PollTask { token, handle });
        Ok(())
    }

    /// Poll at the configured interval.
    pub fn start_default_polling(&self) -> Result<(), CommandError> {
        self.start_polling(Duration::from_millis(self.core.config.poll_interval_ms))
    }

    pub fn stop_polling(&self) {
        self.core.stop_polling();
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.core.poller)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Stop polling, interrupt any command in flight and close the port.
    pub fn shutdown(&self) {
        let core = &self.core;
        core.stop_polling();
        core.session.cancel();
        if let Err(e) = core.session.close() {
            warn!(device = %core.id, "Error closing port: {e}");
        }
        core.fire(Trigger::Disconnected);
        info!(device = %core.id, "Device shut down");
    }
}

impl StatusSource for Device {
    fn poll_once(&self) -> Result<StatusCodeSet, CommandError> {
        self.core.poll_once()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::codec::FrameCodec;
    use crate::device::mock::{MockOp, MockRead, MockTransport};
    use crate::device::status::StatusCode;

    const ENABLED: [u8; 1] = [0x14];

    fn reply(payload: &[u8]) -> Vec<u8> {
        let d = protocols::find("ccnet").unwrap();
        FrameCodec::new(d.codec.clone()).encode_reply(payload).unwrap()
    }

    /// 24 records; 10, 50 and 100 RUB at indices 2, 3 and 4.
    fn bill_table() -> Vec<u8> {
        let mut table = vec![0u8; 24 * 5];
        for (index, mantissa, exponent) in [(2usize, 1u8, 1u8), (3, 5, 1), (4, 1, 2)] {
            table[index * 5..index * 5 + 5].copy_from_slice(&[mantissa, b'R', b'U', b'S', exponent]);
        }
        table
    }

    /// Simulated CCNet acceptor. The poll answer is shared so tests can
    /// move the device through escrow.
    struct Bench {
        mock: MockTransport,
        poll: Arc<Mutex<Vec<u8>>>,
    }

    impl Bench {
        fn new(model: &'static str, fail_mask: bool) -> Self {
            let mock = MockTransport::new();
            let poll = Arc::new(Mutex::new(vec![0x19]));
            let shared = Arc::clone(&poll);
            let mut last_block = 0u8;
            mock.respond_with(move |w| {
                if w.len() == 6 && w[3] == 0x00 {
                    return vec![];
                }
                let answer = if w.len() > 100 {
                    // the loader leaves with its answer to the last block
                    if w[3] == last_block {
                        vec![0x54]
                    } else {
                        vec![0x00, w[3]]
                    }
                } else {
                    let mut poll = shared.lock().unwrap();
                    match w[3] {
                        0x33 => poll.clone(),
                        0x37 => model.as_bytes().to_vec(),
                        0x41 => bill_table(),
                        0x34 if fail_mask => vec![0x30],
                        0x34 => {
                            *poll = ENABLED.to_vec();
                            vec![0x00]
                        }
                        0x35 | 0x36 if poll[0] == 0x80 => {
                            let outcome = if w[3] == 0x35 { 0x81 } else { 0x82 };
                            *poll = vec![outcome, poll[1]];
                            vec![0x00]
                        }
                        0x35 | 0x36 => vec![0x30],
                        0x30 => {
                            *poll = vec![0x19];
                            vec![0x00]
                        }
                        0x51 => vec![0x52],
                        0x52 => {
                            let body = u32::from_le_bytes([w[4], w[5], w[6], w[7]]);
                            last_block = (body.div_ceil(128) as u8).saturating_sub(1);
                            vec![0x53]
                        }
                        _ => vec![0x00],
                    }
                };
                vec![MockRead::Data(reply(&answer))]
            });
            Self { mock, poll }
        }

        fn set_poll(&self, answer: &[u8]) {
            *self.poll.lock().unwrap() = answer.to_vec();
        }

        fn device(&self, config: DeviceConfig) -> (Device, mpsc::UnboundedReceiver<DeviceEvent>) {
            Device::new("bv-1", config, self.mock.boxed()).unwrap()
        }

        fn polls(&self) -> usize {
            self.mock
                .writes()
                .iter()
                .filter(|w| w.len() == 6 && w[3] == 0x33)
                .count()
        }
    }

    fn config() -> DeviceConfig {
        DeviceConfig::new("ccnet", "mock")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[DeviceEvent]) -> Vec<DeviceState> {
        events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_to_ready() {
        let bench = Bench::new("SM-2072", false);
        let (device, mut rx) = bench.device(config());
        device.connect().unwrap();

        assert_eq!(device.state(), DeviceState::Ready);
        assert!(device.is_connected());
        let model = device.model().unwrap();
        assert_eq!(model.model, "SM-2072");
        assert!(model.verified && model.caps.firmware_update);

        let nominals: Vec<f64> = device.denominations().iter().map(|d| d.nominal).collect();
        assert_eq!(nominals, vec![10.0, 50.0, 100.0]);

        // indices 2..=4 over 24 channels, big-endian, sent twice
        let mask = bench
            .mock
            .writes()
            .into_iter()
            .find(|w| w.len() > 6 && w[3] == 0x34)
            .unwrap();
        assert_eq!(mask[4..10], [0x00, 0x00, 0x1C, 0x00, 0x00, 0x1C]);

        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                DeviceState::Identifying,
                DeviceState::Verified,
                DeviceState::Initializing,
                DeviceState::Ready
            ]
        );
    }

    #[test]
    fn test_configured_denominations() {
        let bench = Bench::new("SM-2072", false);
        let mut cfg = config();
        cfg.enabled_denominations = Some([3].into_iter().collect());
        let (device, _rx) = bench.device(cfg);
        device.connect().unwrap();

        let enabled: Vec<u8> = device
            .denominations()
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.index)
            .collect();
        assert_eq!(enabled, vec![3]);
    }

    #[test]
    fn test_unverified_defaults_fail_not_ready() {
        let bench = Bench::new("XYZ-99", true);
        let (device, mut rx) = bench.device(config());

        let err = device.connect().unwrap_err();
        assert!(matches!(err, CommandError::Device { code: 0x30, .. }));
        assert_eq!(device.state(), DeviceState::ErrorState);
        assert!(device.is_connected());
        assert!(!device.is_ready());
        assert!(!device.model().unwrap().verified);
        assert!(states(&drain(&mut rx)).contains(&DeviceState::Unverified));

        // defined failures, no state change
        assert!(matches!(device.stack(), Err(CommandError::NotReady(_))));
        assert!(matches!(device.reject(), Err(CommandError::NotReady(_))));
        assert!(matches!(
            device.execute(CommandId::Poll, &[]),
            Err(CommandError::NotReady(_))
        ));
        assert_eq!(device.state(), DeviceState::ErrorState);
        assert!(device.escrow().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unverified_refused_when_disallowed() {
        let bench = Bench::new("XYZ-99", false);
        let mut cfg = config();
        cfg.features.allow_unverified = false;
        let (device, _rx) = bench.device(cfg);

        let err = device.connect().unwrap_err();
        assert!(matches!(err, CommandError::Configuration(_)));
        assert_eq!(device.state(), DeviceState::ErrorState);
    }

    #[test]
    fn test_probe_failure_leaves_disconnected() {
        let mock = MockTransport::new();
        let (device, _rx) = Device::new("bv-1", config(), mock.boxed()).unwrap();
        assert!(device.connect().unwrap_err().is_transport());
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(mock.ops().contains(&MockOp::Close));
    }

    #[test]
    fn test_escrow_then_stack() {
        let bench = Bench::new("SM-2072", false);
        let (device, mut rx) = bench.device(config());
        device.connect().unwrap();
        drain(&mut rx);

        bench.set_poll(&[0x80, 0x03]);
        let status = device.status();
        assert!(status.contains(StatusCode::Escrow));
        assert_eq!(device.escrow().unwrap().nominal, 50.0);

        // nothing else goes out while the note waits
        assert_eq!(
            device.execute(CommandId::Identify, &[]),
            Err(CommandError::EscrowPending)
        );
        device.status();

        let escrow = device.stack().unwrap();
        assert_eq!(escrow.index, 3);
        assert_eq!(escrow.state, EscrowState::Stacked);
        assert!(device.escrow().is_none());

        let events = drain(&mut rx);
        let presented = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::EscrowPresented { .. }))
            .count();
        let resolved: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::EscrowResolved { escrow } => Some(escrow.state),
                _ => None,
            })
            .collect();
        assert_eq!(presented, 1);
        assert_eq!(resolved, vec![EscrowState::Stacked]);
        assert!(device.execute(CommandId::Identify, &[]).is_ok());
    }

    #[test]
    fn test_identify_refused_during_escrow() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        let identifies = || {
            bench
                .mock
                .writes()
                .iter()
                .filter(|w| w.len() == 6 && w[3] == 0x37)
                .count()
        };
        let before = identifies();

        bench.set_poll(&[0x80, 0x02]);
        device.status();
        assert!(matches!(device.identify(), Err(CommandError::EscrowPending)));
        assert_eq!(identifies(), before);
        assert_eq!(device.escrow().unwrap().index, 2);

        device.stack().unwrap();
        assert_eq!(device.identify().unwrap().model, "SM-2072");
        assert_eq!(identifies(), before + 1);
    }

    #[test]
    fn test_hold_extends_escrow() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        assert_eq!(device.hold(), Err(CommandError::NoEscrow));

        bench.set_poll(&[0x80, 0x03]);
        device.status();
        device.hold().unwrap();
        assert!(bench.mock.writes().iter().any(|w| w.len() == 6 && w[3] == 0x38));
        assert_eq!(device.escrow().unwrap().index, 3);
        assert_eq!(device.stack().unwrap().state, EscrowState::Stacked);
    }

    #[test]
    fn test_hold_needs_capability() {
        let bench = Bench::new("XYZ-99", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        assert!(!device.model().unwrap().caps.escrow_hold);

        bench.set_poll(&[0x80, 0x03]);
        device.status();
        assert!(matches!(device.hold(), Err(CommandError::Configuration(_))));
        assert!(!bench.mock.writes().iter().any(|w| w.len() == 6 && w[3] == 0x38));
    }

    #[test]
    fn test_busy_status_outlives_command() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();

        bench.set_poll(&[0x15]);
        device.status();
        assert_eq!(device.state(), DeviceState::Busy);
        device.execute(CommandId::Identify, &[]).unwrap();
        assert_eq!(device.state(), DeviceState::Busy);

        bench.set_poll(&ENABLED);
        device.status();
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_reject_returns_note() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();

        bench.set_poll(&[0x80, 0x04]);
        device.status();
        let escrow = device.reject().unwrap();
        assert_eq!((escrow.index, escrow.state), (4, EscrowState::Returned));
        assert_eq!(device.escrow_history().len(), 1);
    }

    #[test]
    fn test_stack_without_escrow() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        assert_eq!(device.stack(), Err(CommandError::NoEscrow));
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_not_available_then_reset() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();

        device.core.process_status(&StatusCodeSet::not_available());
        assert_eq!(device.state(), DeviceState::ErrorState);
        // polling alone never recovers
        device.status();
        assert_eq!(device.state(), DeviceState::ErrorState);

        device.reset().unwrap();
        assert_eq!(device.state(), DeviceState::Ready);
        assert!(bench.mock.writes().iter().any(|w| w.len() == 6 && w[3] == 0x30));
    }

    #[test]
    fn test_reset_returns_held_note() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        bench.set_poll(&[0x80, 0x02]);
        device.status();

        device.reset().unwrap();
        assert!(device.escrow().is_none());
        assert_eq!(device.escrow_history()[0].state, EscrowState::Returned);
    }

    #[test]
    fn test_device_error_moves_to_error_state() {
        let bench = Bench::new("SM-2072", false);
        let (device, mut rx) = bench.device(config());
        device.connect().unwrap();
        drain(&mut rx);

        // Stack is answered with "illegal command" outside escrow
        bench.set_poll(&[0x14]);
        let err = device.execute(CommandId::Stack, &[]).unwrap_err();
        assert!(matches!(err, CommandError::Device { code: 0x30, .. }));
        assert_eq!(device.state(), DeviceState::ErrorState);
        assert!(drain(&mut rx).contains(&DeviceEvent::CommandCompleted {
            command: CommandId::Stack,
            success: false
        }));
    }

    #[test]
    fn test_disconnected_device() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        assert!(device.status().contains(StatusCode::NotAvailable));
        assert!(matches!(
            device.execute(CommandId::Poll, &[]),
            Err(CommandError::NotConnected(_))
        ));
        assert!(matches!(device.reset(), Err(CommandError::NotConnected(_))));
        assert!(bench.mock.writes().is_empty());
    }

    #[test]
    fn test_firmware_update_reinitialises() {
        let bench = Bench::new("SM-2072", false);
        let (device, mut rx) = bench.device(config());
        device.connect().unwrap();
        drain(&mut rx);

        let image: Vec<u8> = (0..32 + 256).map(|i| i as u8).collect();
        device.update_firmware(&image).unwrap();

        let events = drain(&mut rx);
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::FirmwareProgress { done, total } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        assert_eq!(bench.mock.baud_history(), vec![115_200, 9600]);
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_firmware_refused_in_error_state() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        device.core.process_status(&StatusCodeSet::not_available());
        assert_eq!(device.state(), DeviceState::ErrorState);

        let image: Vec<u8> = (0..32 + 128).map(|i| i as u8).collect();
        assert!(matches!(
            device.update_firmware(&image),
            Err(FirmwareError::Command(CommandError::NotReady(_)))
        ));
        assert_eq!(device.state(), DeviceState::ErrorState);
        assert!(bench.mock.baud_history().is_empty());
        assert!(!bench.mock.writes().iter().any(|w| w.len() == 6 && w[3] == 0x51));
    }

    #[test]
    fn test_firmware_needs_capability() {
        let bench = Bench::new("MVU-7", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        assert!(matches!(
            device.update_firmware(&[0u8; 64]),
            Err(FirmwareError::Unsupported)
        ));
    }

    #[test]
    fn test_shutdown_closes_port() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        device.connect().unwrap();
        device.shutdown();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(!device.is_connected());
        assert_eq!(bench.mock.ops().last(), Some(&MockOp::Close));
    }

    #[test]
    fn test_polling_needs_runtime() {
        let bench = Bench::new("SM-2072", false);
        let (device, _rx) = bench.device(config());
        assert!(matches!(
            device.start_polling(Duration::from_millis(10)),
            Err(CommandError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_polling_reports_escrow() {
        let bench = Bench::new("SM-2072", false);
        let (device, mut rx) = bench.device(config());
        let d = device.clone();
        tokio::task::spawn_blocking(move || d.connect())
            .await
            .unwrap()
            .unwrap();
        drain(&mut rx);

        bench.set_poll(&[0x80, 0x02]);
        device.start_polling(Duration::from_millis(20)).unwrap();
        assert!(device.is_polling());

        let presented = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(DeviceEvent::EscrowPresented { escrow }) => break Some(escrow),
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(presented.index, 2);

        device.stop_polling();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let polls = bench.polls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bench.polls(), polls);
        assert!(!device.is_polling());
    }
}
