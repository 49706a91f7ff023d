//! Shtrih-M fiscal printers.
//!
//! `STX LEN CMD DATA LRC` behind an ENQ-less ACK/NAK handshake. Answers
//! echo the command byte followed by an error byte. Most commands carry the
//! operator password as their first four data bytes.

use crate::device::classifier::{
    ErrorTable, ModeProbe, Remediation, RemediationPlans, RemediationStep,
};
use crate::device::codec::{Checksum, CodecRules, LengthRule, LengthScope};
use crate::device::command::{CommandId, CommandTable};
use crate::device::protocol::{
    DeviceKind, ModelEntry, ModelPattern, ModelTable, ProtocolDescriptor, ResponseRule,
};
use crate::device::status::{FieldRule, StatusCode, StatusLayout};
use crate::device::transport::PortSettings;

const STX: u8 = 0x02;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// Operator password shipped with every printer.
pub const DEFAULT_PASSWORD: u32 = 30;

// Modes reported in the low nibble of the mode byte.
const MODE_SESSION_OPEN: u8 = 2;
const MODE_SESSION_EXPIRED: u8 = 3;
const MODE_SESSION_CLOSED: u8 = 4;
const MODE_DOCUMENT_OPEN: u8 = 8;

/// Offset of the mode byte in the long status answer.
const LONG_STATUS_MODE_AT: usize = 13;

fn commands() -> CommandTable {
    use CommandId::*;

    let mut t = CommandTable::new();
    t.register(GetStatus, &[0x10], 1000, true).service();
    t.register(GetLongStatus, &[0x11], 1000, true).service();
    t.register(PrintLine, &[0x17], 5000, false).service();
    t.register(XReport, &[0x40], 30_000, false).service();
    t.register(ZReport, &[0x41], 30_000, false).service();
    t.register(CancelDocument, &[0x88], 5000, true).service();
    t.register(ContinuePrint, &[0xB0], 5000, false).service();
    t.register(Identify, &[0xFC], 1000, true);
    t
}

fn errors() -> ErrorTable {
    use CommandId::*;

    let mut e = ErrorTable::new();
    e.insert(0x01, "fiscal memory failure");
    e.insert(0x33, "incorrect command parameters");
    e.insert(0x37, "command is not supported");
    e.insert(0x4A, "document is open, operation impossible")
        .remediate(Remediation::CancelDocument)
        .except(CancelDocument);
    e.insert(0x4E, "shift lasted more than 24 hours")
        .remediate(Remediation::CloseSession)
        .except(ZReport);
    e.insert(0x4F, "invalid password");
    e.insert(0x50, "previous print command in progress")
        .remediate(Remediation::WaitForPrinting);
    e.insert(0x58, "waiting for continue print command")
        .remediate(Remediation::ContinuePrinting)
        .except(ContinuePrint);
    e.insert(0x6B, "no receipt paper");
    e.insert(0x73, "command not supported in this mode")
        .remediate(Remediation::ResolveMode)
        .except(GetLongStatus);
    e
}

fn remediation() -> RemediationPlans {
    use RemediationStep::*;

    RemediationPlans::new()
        .plan(Remediation::CancelDocument, vec![Send(CommandId::CancelDocument)])
        .plan(Remediation::CloseSession, vec![Send(CommandId::ZReport)])
        .plan(Remediation::ContinuePrinting, vec![Send(CommandId::ContinuePrint)])
        .plan(
            Remediation::WaitForPrinting,
            vec![WaitWhile {
                code: StatusCode::Printing,
                timeout_ms: 10_000,
            }],
        )
        .plan(Remediation::ResolveMode, vec![ResolveMode])
        .with_mode_probe(ModeProbe {
            command: CommandId::GetLongStatus,
            byte: LONG_STATUS_MODE_AT,
            mask: 0x0F,
            modes: vec![
                (MODE_DOCUMENT_OPEN, Remediation::CancelDocument),
                (MODE_SESSION_EXPIRED, Remediation::CloseSession),
            ],
        })
}

/// Short status: operator, flags (2 bytes), mode, submode.
fn status() -> StatusLayout {
    use StatusCode::*;

    StatusLayout::Fields {
        min_len: 5,
        rules: vec![
            FieldRule::new(3, 0x0F, MODE_SESSION_OPEN, SessionOpened),
            FieldRule::new(3, 0x0F, MODE_SESSION_EXPIRED, SessionExpired),
            FieldRule::new(3, 0x0F, MODE_SESSION_CLOSED, SessionClosed),
            FieldRule::new(3, 0x0F, MODE_DOCUMENT_OPEN, DocumentOpened),
            FieldRule::new(4, 0xFF, 1, PaperEnd),
            FieldRule::new(4, 0xFF, 2, PaperEnd),
            FieldRule::new(4, 0xFF, 3, Paused),
            FieldRule::new(4, 0xFF, 4, Printing),
            FieldRule::new(4, 0xFF, 5, Printing),
            FieldRule::new(2, 0x02, 0x02, CoverOpen),
        ],
    }
}

pub fn descriptor() -> ProtocolDescriptor {
    ProtocolDescriptor {
        name: "shtrih",
        kind: DeviceKind::FiscalPrinter,
        port: PortSettings::new(115_200),
        codec: CodecRules::new(&[STX], LengthRule::new(LengthScope::Payload), Checksum::Xor)
            .with_checksum_from(1)
            .with_handshake(ACK, NAK),
        commands: commands(),
        response: ResponseRule::EchoAndError,
        confirm: None,
        errors: errors(),
        remediation: remediation(),
        status_command: CommandId::GetStatus,
        status: status(),
        identify_command: CommandId::Identify,
        models: ModelTable {
            // device type answer: type, subtype, version, subversion, model, language, name
            entries: vec![
                ModelEntry::new("SHTRIH-FR-F", ModelPattern::Code { at: 4, value: 0 }),
                ModelEntry::new("SHTRIH-FR-K", ModelPattern::Code { at: 4, value: 2 }),
                ModelEntry::new("SHTRIH-MINI-FR-K", ModelPattern::Code { at: 4, value: 4 }),
                ModelEntry::new("SHTRIH-M-PTK", ModelPattern::Prefix("SHTRIH-M")),
            ],
            allow_unverified: true,
            name_at: 6,
            name_len: None,
        },
        init: vec![],
        enable: None,
        par_table: None,
        mask: None,
        firmware: None,
        default_password: Some(DEFAULT_PASSWORD),
    }
}
