//! CCNet bill acceptors.
//!
//! `02 03 LEN CMD DATA CRC16` with LEN counting the whole frame. Data
//! answers are confirmed with an ACK frame.

use crate::device::classifier::{ErrorTable, RemediationPlans};
use crate::device::codec::{Checksum, CodecRules, LengthRule, LengthScope};
use crate::device::command::{AnswerKind, CommandId, CommandTable};
use crate::device::firmware::FirmwareProfile;
use crate::device::ledger::{CurrencyRule, MaskEncoding, ParTableLayout};
use crate::device::protocol::{
    Capabilities, DeviceKind, InitStep, ModelEntry, ModelPattern, ModelTable, ProtocolDescriptor,
    ResponseRule,
};
use crate::device::status::{CodeEntry, StatusCode, StatusLayout};
use crate::device::transport::PortSettings;

const ACK: u8 = 0x00;
const NAK: u8 = 0xFF;

fn commands() -> CommandTable {
    use CommandId::*;

    let mut t = CommandTable::new();
    t.register(Reset, &[0x30], 1000, true).answer(AnswerKind::Ack);
    t.register(GetStatus, &[0x31], 300, true);
    t.register(SetSecurity, &[0x32], 300, true).answer(AnswerKind::Ack);
    t.register(Poll, &[0x33], 300, true);
    t.register(EnableBillTypes, &[0x34], 300, true).answer(AnswerKind::Ack);
    t.register(Stack, &[0x35], 500, false).answer(AnswerKind::Ack);
    t.register(Return, &[0x36], 500, false).answer(AnswerKind::Ack);
    t.register(Identify, &[0x37], 500, true);
    t.register(Hold, &[0x38], 500, false).answer(AnswerKind::Ack);
    t.register(GetBillTable, &[0x41], 1000, true);

    t.register(FirmwareSetBaud, &[0x51], 1000, false);
    t.register(FirmwareHead, &[0x52], 2000, false);
    t.register(FirmwareBlock, &[], 2000, false);
    t.register(FirmwareExit, &[0x54], 3000, false);
    t
}

fn status() -> StatusLayout {
    use StatusCode::*;

    StatusLayout::CodeStream {
        entries: vec![
            CodeEntry::plain(0x10, PowerUp),
            CodeEntry::plain(0x11, PowerUp),
            CodeEntry::plain(0x12, PowerUp),
            CodeEntry::plain(0x13, Initializing),
            CodeEntry::plain(0x14, Enabled),
            CodeEntry::plain(0x15, Accepting),
            CodeEntry::plain(0x17, Stacking),
            CodeEntry::plain(0x18, Returning),
            CodeEntry::plain(0x19, Disabled),
            CodeEntry::plain(0x1A, Holding),
            CodeEntry::with_data(0x1B, Busy),
            CodeEntry::with_data(0x1C, Rejected),
            CodeEntry::plain(0x41, StackerFull),
            CodeEntry::plain(0x42, StackerOpen),
            CodeEntry::plain(0x43, ValidatorJam),
            CodeEntry::plain(0x44, StackerJam),
            CodeEntry::plain(0x45, Cheated),
            CodeEntry::plain(0x46, Paused),
            CodeEntry::with_data(0x47, Failure),
            CodeEntry::with_data(0x80, Escrow),
            CodeEntry::with_data(0x81, Stacked),
            CodeEntry::with_data(0x82, Returned),
        ],
    }
}

fn models() -> ModelTable {
    let bill_to_bill = Capabilities {
        min_channels: 24,
        firmware_update: true,
        update_baud: None,
        escrow_hold: true,
    };
    ModelTable {
        entries: vec![
            ModelEntry::new("SM", ModelPattern::Prefix("SM-")).with_caps(bill_to_bill),
            ModelEntry::new("MSM", ModelPattern::Prefix("MSM")).with_caps(bill_to_bill),
            ModelEntry::new("MVU", ModelPattern::Prefix("MVU")).with_caps(Capabilities {
                min_channels: 24,
                escrow_hold: true,
                ..Capabilities::default()
            }),
        ],
        allow_unverified: true,
        name_at: 0,
        name_len: Some(15),
    }
}

pub fn descriptor() -> ProtocolDescriptor {
    let mut errors = ErrorTable::new();
    errors.insert(0x30, "illegal command");

    ProtocolDescriptor {
        name: "ccnet",
        kind: DeviceKind::BillAcceptor,
        port: PortSettings::new(9600),
        codec: CodecRules::new(
            &[0x02, 0x03],
            LengthRule::new(LengthScope::Frame),
            Checksum::Crc16Kermit,
        ),
        commands: commands(),
        response: ResponseRule::AckNak {
            ack: ACK,
            nak: Some(NAK),
        },
        confirm: Some(vec![ACK]),
        errors,
        remediation: RemediationPlans::new(),
        status_command: CommandId::Poll,
        status: status(),
        identify_command: CommandId::Identify,
        models: models(),
        init: vec![InitStep::optional(CommandId::SetSecurity, &[0, 0, 0])],
        enable: None,
        par_table: Some(ParTableLayout::Records {
            command: CommandId::GetBillTable,
            record_size: 5,
            first_index: 0,
            index_at: None,
            mantissa_at: 0,
            exponent_at: 4,
            currency: CurrencyRule::Ascii { at: 1 },
        }),
        mask: Some(MaskEncoding {
            command: CommandId::EnableBillTypes,
            min_channels: 24,
            big_endian: true,
            inverted: false,
            duplicate: true,
        }),
        firmware: Some(FirmwareProfile::default()),
        default_password: None,
    }
}
