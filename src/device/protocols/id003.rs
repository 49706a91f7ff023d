//! ID003 bill acceptors.

use crate::device::classifier::{ErrorTable, RemediationPlans};
use crate::device::codec::{Checksum, CodecRules, LengthRule, LengthScope};
use crate::device::command::{AnswerKind, CommandId, CommandTable};
use crate::device::ledger::{CurrencyRule, MaskEncoding, ParTableLayout};
use crate::device::protocol::{
    Capabilities, DeviceKind, InitStep, ModelEntry, ModelPattern, ModelTable, ProtocolDescriptor,
    ResponseRule,
};
use crate::device::status::{CodeEntry, StatusCode, StatusLayout};
use crate::device::transport::{Parity, PortSettings};

/// First escrow code; denomination indices start here.
const FIRST_ESCROW_CODE: u8 = 0x61;

fn commands() -> CommandTable {
    use CommandId::*;

    let mut t = CommandTable::new();
    t.register(Poll, &[0x11], 300, true);
    t.register(Reset, &[0x40], 1000, true).answer(AnswerKind::Ack);
    t.register(Stack, &[0x41], 500, false).answer(AnswerKind::Ack);
    t.register(Return, &[0x43], 500, false).answer(AnswerKind::Ack);
    t.register(Hold, &[0x44], 500, false).answer(AnswerKind::Ack);
    t.register(Identify, &[0x88], 500, true);
    t.register(GetBillTable, &[0x8A], 1000, true);
    // setting commands answer with an echo of themselves
    t.register(SetInhibits, &[0xC0], 300, true);
    t.register(SetSecurity, &[0xC1], 300, true);
    t.register(SetCommunicationMode, &[0xC2], 300, true);
    t.register(EnableDevice, &[0xC3], 300, true);
    t
}

fn status() -> StatusLayout {
    use StatusCode::*;

    StatusLayout::CodeStream {
        entries: vec![
            CodeEntry::plain(0x11, Enabled),
            CodeEntry::plain(0x12, Accepting),
            CodeEntry::with_data(0x13, Escrow),
            CodeEntry::plain(0x14, Stacking),
            CodeEntry::plain(0x15, Stacking),
            CodeEntry::plain(0x16, Stacked),
            CodeEntry::with_data(0x17, Rejected),
            CodeEntry::plain(0x18, Returning),
            CodeEntry::plain(0x19, Holding),
            CodeEntry::plain(0x1A, Disabled),
            CodeEntry::plain(0x1B, Initializing),
            CodeEntry::plain(0x40, PowerUp),
            CodeEntry::plain(0x41, PowerUp),
            CodeEntry::plain(0x42, PowerUp),
            CodeEntry::plain(0x43, StackerFull),
            CodeEntry::plain(0x44, StackerOpen),
            CodeEntry::plain(0x45, ValidatorJam),
            CodeEntry::plain(0x46, StackerJam),
            CodeEntry::plain(0x47, Paused),
            CodeEntry::plain(0x48, Cheated),
            CodeEntry::with_data(0x49, Failure),
            CodeEntry::terminal(0x4A, NotAvailable),
        ],
    }
}

pub fn descriptor() -> ProtocolDescriptor {
    let mut errors = ErrorTable::new();
    errors.insert(0x4B, "invalid command");

    let sixteen = Capabilities {
        min_channels: 16,
        ..Capabilities::default()
    };

    ProtocolDescriptor {
        name: "id003",
        kind: DeviceKind::BillAcceptor,
        port: PortSettings::new(9600).with_parity(Parity::Even),
        codec: CodecRules::new(&[0xFC], LengthRule::new(LengthScope::Frame), Checksum::Crc16Kermit),
        commands: commands(),
        response: ResponseRule::AckNak { ack: 0x50, nak: None },
        confirm: None,
        errors,
        remediation: RemediationPlans::new(),
        status_command: CommandId::Poll,
        status: status(),
        identify_command: CommandId::Identify,
        models: ModelTable {
            entries: vec![
                ModelEntry::new("iVIZION", ModelPattern::Contains("iVIZION")).with_caps(sixteen),
                ModelEntry::new("iPRO", ModelPattern::Contains("iPRO")).with_caps(sixteen),
                ModelEntry::new("UBA", ModelPattern::Contains("UBA")).with_caps(Capabilities {
                    escrow_hold: true,
                    ..sixteen
                }),
            ],
            allow_unverified: true,
            name_at: 0,
            name_len: None,
        },
        init: vec![
            InitStep::optional(CommandId::SetSecurity, &[0x00, 0x00]),
            InitStep::required(CommandId::SetCommunicationMode, &[0x00]),
        ],
        enable: Some(InitStep::required(CommandId::EnableDevice, &[0x00])),
        par_table: Some(ParTableLayout::Records {
            command: CommandId::GetBillTable,
            record_size: 4,
            first_index: FIRST_ESCROW_CODE,
            index_at: Some(0),
            mantissa_at: 2,
            exponent_at: 3,
            currency: CurrencyRule::Lookup {
                at: 1,
                table: vec![
                    (0x01, "JPY"),
                    (0x02, "USD"),
                    (0x03, "EUR"),
                    (0x0A, "CAD"),
                    (0x31, "RUB"),
                ],
            },
        }),
        mask: Some(MaskEncoding {
            command: CommandId::SetInhibits,
            min_channels: 16,
            big_endian: false,
            inverted: true,
            duplicate: false,
        }),
        firmware: None,
        default_password: None,
    }
}
