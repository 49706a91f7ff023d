//! SSP bill validators.
//!
//! `7F SEQ LEN DATA CRC16`, the sequence flag toggling on every new
//! exchange and 0x7F doubled inside the frame.

use crate::device::classifier::{ErrorTable, RemediationPlans};
use crate::device::codec::{Checksum, CodecRules, LengthRule, LengthScope};
use crate::device::command::{CommandId, CommandTable};
use crate::device::ledger::{MaskEncoding, ParTableLayout};
use crate::device::protocol::{
    Capabilities, DeviceKind, InitStep, ModelEntry, ModelPattern, ModelTable, ProtocolDescriptor,
    ResponseRule,
};
use crate::device::status::{CodeEntry, StatusCode, StatusLayout};
use crate::device::transport::{PortSettings, StopBits};

const STX: u8 = 0x7F;
const SEQUENCE_FLAG: u8 = 0x80;

fn commands() -> CommandTable {
    use CommandId::*;

    let mut t = CommandTable::new();
    t.register(Reset, &[0x01], 1000, true);
    t.register(SetInhibits, &[0x02], 300, true);
    t.register(SetupRequest, &[0x05], 1000, true);
    t.register(Poll, &[0x07], 300, true);
    // a held note is stacked by the next poll
    t.register(Stack, &[0x07], 500, false);
    t.register(Return, &[0x08], 500, false);
    t.register(DisableDevice, &[0x09], 300, true);
    t.register(EnableDevice, &[0x0A], 300, true);
    t.register(Sync, &[0x11], 500, true);
    t.register(Hold, &[0x18], 300, false);
    t.register(Identify, &[0x20], 500, true);
    t
}

fn status() -> StatusLayout {
    use StatusCode::*;

    StatusLayout::CodeStream {
        entries: vec![
            CodeEntry::plain(0xF1, PowerUp),
            CodeEntry::with_data(0xEF, Escrow).or_when_zero(Accepting),
            CodeEntry::with_data(0xEE, Stacked),
            CodeEntry::plain(0xED, Returning),
            CodeEntry::plain(0xEC, Rejected),
            CodeEntry::plain(0xCC, Stacking),
            CodeEntry::plain(0xEB, Stacked),
            CodeEntry::plain(0xEA, StackerJam),
            CodeEntry::plain(0xE9, ValidatorJam),
            CodeEntry::plain(0xE8, Disabled),
            CodeEntry::plain(0xE7, StackerFull),
            CodeEntry::with_data(0xE6, Cheated),
            CodeEntry::plain(0xE3, StackerOpen),
            CodeEntry::plain(0xE4, Ok),
            CodeEntry::with_data(0xE1, Returned),
            CodeEntry::with_data(0xE2, Stacked),
            CodeEntry::plain(0xB5, Disabled),
            CodeEntry::plain(0xB6, Initializing),
        ],
    }
}

pub fn descriptor() -> ProtocolDescriptor {
    let mut errors = ErrorTable::new();
    errors.insert(0xF2, "command not known").protocol();
    errors.insert(0xF3, "wrong number of parameters").protocol();
    errors.insert(0xF4, "parameter out of range");
    errors.insert(0xF5, "command cannot be processed");
    errors.insert(0xF6, "software error");
    errors.insert(0xF8, "command failure");
    errors.insert(0xFA, "encryption key not set");

    ProtocolDescriptor {
        name: "ssp",
        kind: DeviceKind::BillAcceptor,
        port: PortSettings {
            stop_bits: StopBits::Two,
            ..PortSettings::new(9600)
        },
        codec: CodecRules::new(
            &[STX, 0x00],
            LengthRule::new(LengthScope::Payload),
            Checksum::Crc16Cms,
        )
        .with_checksum_from(1)
        .with_stuffing(STX)
        .with_sequence_mask(SEQUENCE_FLAG),
        commands: commands(),
        response: ResponseRule::ResultCode { ok: 0xF0, nak: None },
        confirm: None,
        errors,
        remediation: RemediationPlans::new(),
        status_command: CommandId::Poll,
        status: status(),
        identify_command: CommandId::Identify,
        models: ModelTable {
            entries: vec![
                ModelEntry::new("NV200", ModelPattern::Prefix("NV02")).with_caps(Capabilities {
                    min_channels: 16,
                    escrow_hold: true,
                    ..Capabilities::default()
                }),
                ModelEntry::new("NV9", ModelPattern::Prefix("NV009")).with_caps(Capabilities {
                    escrow_hold: true,
                    ..Capabilities::default()
                }),
            ],
            allow_unverified: true,
            name_at: 0,
            name_len: None,
        },
        init: vec![InitStep::required(CommandId::Sync, &[])],
        enable: Some(InitStep::required(CommandId::EnableDevice, &[])),
        par_table: Some(ParTableLayout::SspSetup { first_index: 1 }),
        mask: Some(MaskEncoding {
            command: CommandId::SetInhibits,
            min_channels: 8,
            big_endian: false,
            inverted: false,
            duplicate: false,
        }),
        firmware: None,
        default_password: None,
    }
}
