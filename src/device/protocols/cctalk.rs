//! ccTalk bill validators on a single-wire bus.
//!
//! `DEST LEN SRC HDR DATA SUM`: LEN counts data bytes only and the
//! checksum makes the frame sum to zero. Every transmitted byte is echoed
//! back by the bus.

use crate::device::classifier::{ErrorTable, RemediationPlans};
use crate::device::codec::{Checksum, CodecRules, LengthRule, LengthScope};
use crate::device::command::{CommandId, CommandTable};
use crate::device::ledger::{MaskEncoding, ParTableLayout};
use crate::device::protocol::{
    Capabilities, DeviceKind, InitStep, ModelEntry, ModelPattern, ModelTable, ProtocolDescriptor,
    ResponseRule,
};
use crate::device::status::{StatusCode, StatusLayout};
use crate::device::transport::PortSettings;

const HOST: u8 = 0x01;
const VALIDATOR: u8 = 0x28;

fn commands() -> CommandTable {
    use CommandId::*;

    let mut t = CommandTable::new();
    t.register(Reset, &[1], 1000, true);
    t.register(Sync, &[254], 300, true);
    t.register(Identify, &[244], 500, true);
    t.register(Poll, &[159], 300, true);
    t.register(GetBillId, &[157], 500, true);
    t.register(Stack, &[154, 1], 500, false);
    t.register(Return, &[154, 0], 500, false);
    // route code 255 restarts the escrow timeout
    t.register(Hold, &[154, 255], 500, false);
    t.register(SetInhibits, &[231], 300, true);
    t.register(EnableDevice, &[228, 1], 300, true);
    t.register(DisableDevice, &[228, 0], 300, true);
    t
}

fn status() -> StatusLayout {
    use StatusCode::*;

    StatusLayout::EventLog {
        results: vec![
            (0, Disabled),
            (1, Returned),
            (2, Rejected),
            (3, Rejected),
            (4, Rejected),
            (5, Rejected),
            (6, ValidatorJam),
            (7, StackerJam),
            (8, Cheated),
            (9, Cheated),
            (10, Ok),
            (11, StackerOpen),
            (12, Ok),
            (13, Failure),
            (14, StackerFull),
            (15, StackerJam),
            (16, ValidatorJam),
            (17, Cheated),
            (18, Cheated),
            (19, Failure),
            (20, Rejected),
        ],
    }
}

pub fn descriptor() -> ProtocolDescriptor {
    let mut errors = ErrorTable::new();
    errors.insert(0x06, "device busy").transport();

    ProtocolDescriptor {
        name: "cctalk",
        kind: DeviceKind::BillAcceptor,
        port: PortSettings::new(9600),
        codec: CodecRules::new(
            &[VALIDATOR],
            LengthRule::adjusted(LengthScope::Payload, -1),
            Checksum::Additive,
        )
        .with_reply_prefix(&[HOST])
        .with_infix(&[HOST], &[VALIDATOR])
        .with_local_echo(),
        commands: commands(),
        response: ResponseRule::ResultCode {
            ok: 0x00,
            nak: Some(0x05),
        },
        confirm: None,
        errors,
        remediation: RemediationPlans::new(),
        status_command: CommandId::Poll,
        status: status(),
        identify_command: CommandId::Identify,
        models: ModelTable {
            entries: vec![
                ModelEntry::new("NV9", ModelPattern::Contains("NV9")).with_caps(Capabilities {
                    min_channels: 16,
                    escrow_hold: true,
                    ..Capabilities::default()
                }),
                ModelEntry::new("WBA", ModelPattern::Prefix("WBA")),
            ],
            allow_unverified: true,
            name_at: 0,
            name_len: None,
        },
        init: vec![InitStep::optional(CommandId::Sync, &[])],
        enable: Some(InitStep::required(CommandId::EnableDevice, &[])),
        par_table: Some(ParTableLayout::PerChannel {
            command: CommandId::GetBillId,
            channels: 16,
            first_index: 1,
            countries: vec![("EU", "EUR"), ("GB", "GBP"), ("US", "USD"), ("RU", "RUB")],
        }),
        mask: Some(MaskEncoding {
            command: CommandId::SetInhibits,
            min_channels: 16,
            big_endian: false,
            inverted: false,
            duplicate: false,
        }),
        firmware: None,
        default_password: None,
    }
}
