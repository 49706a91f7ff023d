//! Fiscal registrar operations.
//!
//! Thin typed layer over `Device::execute` for fiscal-printer descriptors.
//! Operator credentials are prepended by the session; recovery from an open
//! document, an expired shift or a paused print is handled by the
//! descriptor's remediation plans.

use super::command::CommandId;
use super::driver::Device;
use super::poller;
use super::protocol::DeviceKind;
use super::status::{StatusCode, StatusCodeSet};
use crate::error::CommandError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Width of one printed line.
pub const LINE_WIDTH: usize = 40;

/// Print on the receipt tape only.
const RECEIPT_TAPE: u8 = 0x02;

/// Reports print for a while before the printer accepts the next command.
const REPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fiscal day as reported by the printer's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiscalSessionState {
    Opened,
    Closed,
    /// Open for more than 24 hours; a Z-report is required.
    Expired,
    DocumentOpen,
    Unknown,
}

impl FiscalSessionState {
    pub fn from_status(status: &StatusCodeSet) -> Self {
        if status.contains(StatusCode::DocumentOpened) {
            Self::DocumentOpen
        } else if status.contains(StatusCode::SessionExpired) {
            Self::Expired
        } else if status.contains(StatusCode::SessionOpened) {
            Self::Opened
        } else if status.contains(StatusCode::SessionClosed) {
            Self::Closed
        } else {
            Self::Unknown
        }
    }
}

/// Lay out one line: `LINE_WIDTH` single-byte characters, space padded.
fn line_bytes(text: &str) -> Vec<u8> {
    let mut line: Vec<u8> = text
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .take(LINE_WIDTH)
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'?' })
        .collect();
    line.resize(LINE_WIDTH, b' ');
    line
}

impl Device {
    /// Fiscal operations, when this device is a fiscal printer.
    pub fn fiscal(&self) -> Option<FiscalPrinter<'_>> {
        (self.descriptor().kind == DeviceKind::FiscalPrinter).then_some(FiscalPrinter { device: self })
    }
}

pub struct FiscalPrinter<'a> {
    device: &'a Device,
}

impl FiscalPrinter<'_> {
    pub fn session_state(&self) -> FiscalSessionState {
        FiscalSessionState::from_status(&self.device.status())
    }

    pub fn is_printing(&self) -> bool {
        self.device.status().contains(StatusCode::Printing)
    }

    /// Print the shift totals without closing the shift.
    pub fn x_report(&self) -> Result<(), CommandError> {
        info!(device = %self.device.id(), "Printing X-report");
        self.report(CommandId::XReport)
    }

    /// Print the shift totals and close the fiscal day.
    pub fn z_report(&self) -> Result<(), CommandError> {
        info!(device = %self.device.id(), "Printing Z-report");
        self.report(CommandId::ZReport)
    }

    fn report(&self, command: CommandId) -> Result<(), CommandError> {
        self.device.execute(command, &[])?;
        poller::wait_until_not_busy(self.device, REPORT_TIMEOUT)?;
        Ok(())
    }

    pub fn cancel_document(&self) -> Result<(), CommandError> {
        self.device.execute(CommandId::CancelDocument, &[])?;
        Ok(())
    }

    /// Resume printing after the paper was replaced.
    pub fn continue_printing(&self) -> Result<(), CommandError> {
        self.device.execute(CommandId::ContinuePrint, &[])?;
        Ok(())
    }

    /// Print one line of text. Longer text is cut at `LINE_WIDTH`; characters
    /// the printer cannot encode are printed as `?`.
    pub fn print_line(&self, text: &str) -> Result<(), CommandError> {
        let mut data = vec![RECEIPT_TAPE];
        data.extend(line_bytes(text));
        debug!("Print line {:?}", text);
        self.device.execute(CommandId::PrintLine, &data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::codec::FrameCodec;
    use crate::device::mock::{MockRead, MockTransport};
    use crate::device::protocols;
    use crate::device::state::DeviceState;
    use std::sync::{Arc, Mutex};

    const ACK: u8 = 0x06;

    fn reply(payload: &[u8]) -> Vec<u8> {
        let d = protocols::find("shtrih").unwrap();
        FrameCodec::new(d.codec.clone()).encode_reply(payload).unwrap()
    }

    /// Mode and submode reported by the simulated printer.
    #[derive(Clone, Copy)]
    struct Modes {
        mode: u8,
        submode: u8,
    }

    fn printer(initial: u8) -> (MockTransport, Arc<Mutex<Modes>>) {
        let mock = MockTransport::new();
        let modes = Arc::new(Mutex::new(Modes {
            mode: initial,
            submode: 0,
        }));
        let shared = Arc::clone(&modes);
        let mut document_errors = 0;
        mock.respond_with(move |w| {
            if w.len() == 1 {
                return vec![];
            }
            let cmd = w[2];
            let mut m = shared.lock().unwrap();
            let (err, data) = match cmd {
                0x10 => (0, vec![0x1E, 0x00, 0x00, m.mode, m.submode]),
                0xFC => {
                    let mut data = vec![0, 0, 1, 0, 0, 0];
                    data.extend_from_slice(b"SHTRIH-FR-F");
                    (0, data)
                }
                0x17 if m.mode == 8 && document_errors == 0 => {
                    document_errors += 1;
                    (0x4A, vec![])
                }
                0x41 => {
                    m.mode = 4;
                    (0, vec![])
                }
                0x88 => {
                    m.mode = 2;
                    (0, vec![])
                }
                0xB0 => {
                    m.submode = 0;
                    (0, vec![])
                }
                _ => (0, vec![]),
            };
            let mut payload = vec![cmd, err];
            payload.extend(data);
            vec![MockRead::Data(vec![ACK]), MockRead::Data(reply(&payload))]
        });
        (mock, modes)
    }

    fn connected(mock: &MockTransport) -> Device {
        let (device, _rx) =
            Device::new("fr-1", DeviceConfig::new("shtrih", "mock"), mock.boxed()).unwrap();
        device.connect().unwrap();
        device
    }

    fn frames(mock: &MockTransport, cmd: u8) -> Vec<Vec<u8>> {
        mock.writes()
            .into_iter()
            .filter(|w| w.len() > 2 && w[2] == cmd)
            .collect()
    }

    #[test]
    fn test_connects_as_fiscal_printer() {
        let (mock, _) = printer(2);
        let device = connected(&mock);
        assert_eq!(device.state(), DeviceState::Ready);
        assert_eq!(device.model().unwrap().model, "SHTRIH-FR-F");
        assert!(device.fiscal().is_some());
    }

    #[test]
    fn test_acceptor_has_no_fiscal_operations() {
        let (device, _rx) =
            Device::new("bv-1", DeviceConfig::new("ccnet", "mock"), MockTransport::new().boxed())
                .unwrap();
        assert!(device.fiscal().is_none());
    }

    #[test]
    fn test_session_state_from_mode() {
        let (mock, modes) = printer(2);
        let device = connected(&mock);
        let fr = device.fiscal().unwrap();
        assert_eq!(fr.session_state(), FiscalSessionState::Opened);

        for (mode, expected) in [
            (3, FiscalSessionState::Expired),
            (4, FiscalSessionState::Closed),
            (8, FiscalSessionState::DocumentOpen),
            (1, FiscalSessionState::Unknown),
        ] {
            modes.lock().unwrap().mode = mode;
            assert_eq!(fr.session_state(), expected, "mode {mode}");
        }
    }

    #[test]
    fn test_z_report_closes_session() {
        let (mock, _) = printer(2);
        let device = connected(&mock);
        let fr = device.fiscal().unwrap();

        fr.z_report().unwrap();
        assert_eq!(fr.session_state(), FiscalSessionState::Closed);
        let z = frames(&mock, 0x41);
        assert_eq!(z.len(), 1);
        // operator password leads the data
        assert_eq!(z[0][3..7], [0x1E, 0x00, 0x00, 0x00]);
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_print_line_layout() {
        let (mock, _) = printer(2);
        let device = connected(&mock);
        device.fiscal().unwrap().print_line("Total: 100 ₽").unwrap();

        let frame = &frames(&mock, 0x17)[0];
        // STX LEN CMD password(4) flags text(40) LRC
        assert_eq!(frame.len(), 3 + 4 + 1 + LINE_WIDTH + 1);
        assert_eq!(frame[7], RECEIPT_TAPE);
        let text = &frame[8..8 + LINE_WIDTH];
        assert!(text.starts_with(b"Total: 100 ?"));
        assert!(text[12..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn test_long_line_is_cut() {
        assert_eq!(line_bytes(&"x".repeat(55)), vec![b'x'; LINE_WIDTH]);
        assert_eq!(&line_bytes("a\r\nb")[..3], b"ab ");
    }

    #[test]
    fn test_open_document_cancelled_before_printing() {
        let (mock, _) = printer(8);
        let device = connected(&mock);
        device.fiscal().unwrap().print_line("hello").unwrap();
        assert_eq!(frames(&mock, 0x88).len(), 1);
        assert_eq!(frames(&mock, 0x17).len(), 2);
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_continue_printing() {
        let (mock, modes) = printer(2);
        let device = connected(&mock);
        modes.lock().unwrap().submode = 3;
        let fr = device.fiscal().unwrap();
        assert!(device.status().contains(StatusCode::Paused));
        fr.continue_printing().unwrap();
        assert!(!device.status().contains(StatusCode::Paused));
        assert!(!fr.is_printing());
    }
}
