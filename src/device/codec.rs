//! Generalized frame codec.
//!
//! Every supported wire protocol is described by a `CodecRules` value rather
//! than by its own framing code. A frame is laid out as
//!
//! ```text
//! prefix | LEN | infix | payload | postamble | checksum | terminator
//! ```
//!
//! where `prefix` holds sync and address bytes, `infix` holds fixed bytes
//! after the length (a source address, for example), and the checksum covers
//! everything from `checksum_from` up to itself. Byte stuffing, a sequence
//! toggle bit, an ACK/NAK handshake and local echo are flags on the same
//! value.

use crate::error::FrameError;

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Frame check algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// XOR of all covered bytes (1 byte).
    Xor,
    /// Two's-complement sum, so the covered bytes plus checksum sum to zero (1 byte).
    Additive,
    /// CRC16, reflected polynomial 0x8408, init 0, transmitted LSB first.
    Crc16Kermit,
    /// CRC16, polynomial 0x8005, init 0xFFFF, MSB-first, transmitted LSB first.
    Crc16Cms,
}

impl Checksum {
    pub fn width(self) -> usize {
        match self {
            Self::Xor | Self::Additive => 1,
            Self::Crc16Kermit | Self::Crc16Cms => 2,
        }
    }

    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Self::Xor => data.iter().fold(0u8, |acc, &b| acc ^ b) as u16,
            Self::Additive => {
                let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
                0u8.wrapping_sub(sum) as u16
            }
            Self::Crc16Kermit => crc16_kermit(data),
            Self::Crc16Cms => crc16_cms(data),
        }
    }
}

pub fn crc16_kermit(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn crc16_cms(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// What the length byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthScope {
    /// The whole frame, including sync bytes and checksum.
    Frame,
    /// Infix, payload and postamble.
    Body,
    /// Payload only.
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthRule {
    pub scope: LengthScope,
    /// Added to the counted size before it is written to the wire.
    pub adjust: i16,
}

impl LengthRule {
    pub const fn new(scope: LengthScope) -> Self {
        Self { scope, adjust: 0 }
    }

    pub const fn adjusted(scope: LengthScope, adjust: i16) -> Self {
        Self { scope, adjust }
    }
}

/// Single-byte acknowledgement exchanged after every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub ack: u8,
    pub nak: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecRules {
    pub prefix: Vec<u8>,
    /// Prefix the device uses in replies, when it differs from ours.
    pub reply_prefix: Option<Vec<u8>>,
    pub length: LengthRule,
    pub infix: Vec<u8>,
    pub reply_infix: Option<Vec<u8>>,
    pub postamble: Option<u8>,
    pub checksum: Checksum,
    /// Offset of the first byte covered by the checksum.
    pub checksum_from: usize,
    pub terminator: Option<u8>,
    /// Byte that is doubled wherever it occurs after the first frame byte.
    pub stuffing: Option<u8>,
    /// Toggle bit carried in the last prefix byte and echoed by the device.
    pub sequence_mask: Option<u8>,
    pub handshake: Option<Handshake>,
    /// The line echoes every transmitted byte back to us.
    pub local_echo: bool,
    pub max_frame: usize,
}

impl CodecRules {
    pub fn new(prefix: &[u8], length: LengthRule, checksum: Checksum) -> Self {
        Self {
            prefix: prefix.to_vec(),
            reply_prefix: None,
            length,
            infix: Vec::new(),
            reply_infix: None,
            postamble: None,
            checksum,
            checksum_from: 0,
            terminator: None,
            stuffing: None,
            sequence_mask: None,
            handshake: None,
            local_echo: false,
            max_frame: 255,
        }
    }

    pub fn with_reply_prefix(mut self, prefix: &[u8]) -> Self {
        self.reply_prefix = Some(prefix.to_vec());
        self
    }

    pub fn with_infix(mut self, infix: &[u8], reply_infix: &[u8]) -> Self {
        self.infix = infix.to_vec();
        self.reply_infix = Some(reply_infix.to_vec());
        self
    }

    pub fn with_postamble(mut self, byte: u8) -> Self {
        self.postamble = Some(byte);
        self
    }

    pub fn with_checksum_from(mut self, offset: usize) -> Self {
        self.checksum_from = offset;
        self
    }

    pub fn with_terminator(mut self, byte: u8) -> Self {
        self.terminator = Some(byte);
        self
    }

    pub fn with_stuffing(mut self, byte: u8) -> Self {
        self.stuffing = Some(byte);
        self
    }

    pub fn with_sequence_mask(mut self, mask: u8) -> Self {
        self.sequence_mask = Some(mask);
        self
    }

    pub fn with_handshake(mut self, ack: u8, nak: u8) -> Self {
        self.handshake = Some(Handshake { ack, nak });
        self
    }

    pub fn with_local_echo(mut self) -> Self {
        self.local_echo = true;
        self
    }

    pub fn with_max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }

    fn trailer_len(&self) -> usize {
        self.postamble.is_some() as usize
            + self.checksum.width()
            + self.terminator.is_some() as usize
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

enum Parsed {
    Incomplete,
    Complete { payload: Vec<u8>, len: usize },
}

/// Frame builder/parser for one protocol instance.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    rules: CodecRules,
    sequence: bool,
}

impl FrameCodec {
    pub fn new(rules: CodecRules) -> Self {
        Self {
            rules,
            sequence: false,
        }
    }

    pub fn rules(&self) -> &CodecRules {
        &self.rules
    }

    /// Advance the sequence bit for a new exchange. Retransmissions reuse it.
    pub fn next_sequence(&mut self) {
        if self.rules.sequence_mask.is_some() {
            self.sequence = !self.sequence;
        }
    }

    /// Restart the sequence so the next frame carries the bit set.
    pub fn reset_sequence(&mut self) {
        self.sequence = true;
    }

    fn sequenced(&self, byte: u8) -> u8 {
        match self.rules.sequence_mask {
            Some(mask) if self.sequence => byte | mask,
            Some(mask) => byte & !mask,
            None => byte,
        }
    }

    fn reply_prefix(&self) -> &[u8] {
        self.rules
            .reply_prefix
            .as_deref()
            .unwrap_or(&self.rules.prefix)
    }

    fn reply_infix(&self) -> &[u8] {
        self.rules.reply_infix.as_deref().unwrap_or(&self.rules.infix)
    }

    /// Build a host frame carrying `command` followed by `data`.
    pub fn encode(&self, command: &[u8], data: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut payload = Vec::with_capacity(command.len() + data.len());
        payload.extend_from_slice(command);
        payload.extend_from_slice(data);
        self.build(&self.rules.prefix, &self.rules.infix, &payload)
    }

    /// Build a frame the way the device would send it.
    pub fn encode_reply(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        self.build(self.reply_prefix(), self.reply_infix(), payload)
    }

    fn build(&self, prefix: &[u8], infix: &[u8], payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let rules = &self.rules;
        let post = rules.postamble.is_some() as usize;
        let total = prefix.len() + 1 + infix.len() + payload.len() + rules.trailer_len();
        let counted = match rules.length.scope {
            LengthScope::Frame => total,
            LengthScope::Body => infix.len() + payload.len() + post,
            LengthScope::Payload => payload.len(),
        } as i32
            + rules.length.adjust as i32;
        if total > rules.max_frame || !(0..=255).contains(&counted) {
            return Err(FrameError::Malformed(format!(
                "payload of {} bytes does not fit the length field",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(prefix);
        if let Some(last) = frame.last_mut() {
            *last = self.sequenced(*last);
        }
        frame.push(counted as u8);
        frame.extend_from_slice(infix);
        frame.extend_from_slice(payload);
        if let Some(p) = rules.postamble {
            frame.push(p);
        }
        let crc = rules
            .checksum
            .compute(frame.get(rules.checksum_from..).unwrap_or(&[]));
        frame.push(crc as u8);
        if rules.checksum.width() == 2 {
            frame.push((crc >> 8) as u8);
        }
        if let Some(t) = rules.terminator {
            frame.push(t);
        }

        Ok(self.stuff(frame))
    }

    fn stuff(&self, frame: Vec<u8>) -> Vec<u8> {
        let Some(stuff) = self.rules.stuffing else {
            return frame;
        };
        let mut out = Vec::with_capacity(frame.len() + 4);
        for (i, &b) in frame.iter().enumerate() {
            out.push(b);
            if i > 0 && b == stuff {
                out.push(stuff);
            }
        }
        out
    }

    /// Undo byte stuffing. Returns logical bytes, the raw offset just past
    /// each logical byte, and the raw offset of the first unescaped stuffing
    /// byte. A lone stuffing byte is kept as a literal so the declared length
    /// still lines up and the checksum reports the corruption.
    fn unstuff(&self, raw: &[u8]) -> (Vec<u8>, Vec<usize>, Option<usize>) {
        let Some(stuff) = self.rules.stuffing else {
            return (raw.to_vec(), (1..=raw.len()).collect(), None);
        };
        let mut out = Vec::with_capacity(raw.len());
        let mut ends = Vec::with_capacity(raw.len());
        let mut lone = None;
        let Some(&first) = raw.first() else {
            return (out, ends, lone);
        };
        out.push(first);
        ends.push(1);

        let mut i = 1;
        while i < raw.len() {
            if raw[i] == stuff {
                match raw.get(i + 1) {
                    Some(&next) if next == stuff => {
                        out.push(stuff);
                        i += 2;
                    }
                    Some(_) => {
                        if lone.is_none() {
                            lone = Some(i);
                        }
                        out.push(stuff);
                        i += 1;
                    }
                    // the escape may still be on its way
                    None => break,
                }
            } else {
                out.push(raw[i]);
                i += 1;
            }
            ends.push(i);
        }
        (out, ends, lone)
    }

    fn parse(&self, frame: &[u8], prefix: &[u8], infix: &[u8]) -> Result<Parsed, FrameError> {
        let rules = &self.rules;

        for (i, &expected) in prefix.iter().enumerate() {
            let Some(&got) = frame.get(i) else {
                return Ok(Parsed::Incomplete);
            };
            match rules.sequence_mask {
                Some(mask) if i + 1 == prefix.len() => {
                    if got & !mask != expected & !mask {
                        return Err(FrameError::Malformed(format!(
                            "unexpected header byte 0x{got:02X} at {i}"
                        )));
                    }
                    let want = self.sequenced(expected);
                    if got & mask != want & mask {
                        return Err(FrameError::EchoMismatch {
                            expected: vec![want],
                            actual: vec![got],
                        });
                    }
                }
                _ if got != expected => {
                    return Err(FrameError::Malformed(format!(
                        "unexpected header byte 0x{got:02X} at {i}, expected 0x{expected:02X}"
                    )));
                }
                _ => {}
            }
        }

        let Some(&len_byte) = frame.get(prefix.len()) else {
            return Ok(Parsed::Incomplete);
        };
        let declared = len_byte as i32 - rules.length.adjust as i32;
        let fixed = prefix.len() + 1 + infix.len();
        let trailer = rules.trailer_len();
        let post = rules.postamble.is_some() as i32;
        let (total, payload_len) = match rules.length.scope {
            LengthScope::Frame => (declared, declared - (fixed + trailer) as i32),
            LengthScope::Body => {
                let payload = declared - infix.len() as i32 - post;
                ((fixed + trailer) as i32 + payload, payload)
            }
            LengthScope::Payload => ((fixed + trailer) as i32 + declared, declared),
        };
        if payload_len < 0 {
            return Err(FrameError::LengthMismatch {
                declared: declared.max(0) as usize,
                actual: fixed + trailer,
            });
        }
        let total = total as usize;
        let payload_len = payload_len as usize;
        if total > rules.max_frame {
            return Err(FrameError::LengthMismatch {
                declared: total,
                actual: rules.max_frame,
            });
        }
        if frame.len() < total {
            return Ok(Parsed::Incomplete);
        }
        let frame = &frame[..total];

        if &frame[prefix.len() + 1..fixed] != infix {
            return Err(FrameError::Malformed(format!(
                "unexpected address bytes {:02X?}",
                &frame[prefix.len() + 1..fixed]
            )));
        }

        let mut end = total;
        if let Some(t) = rules.terminator {
            if frame[total - 1] != t {
                return Err(FrameError::LengthMismatch {
                    declared: total,
                    actual: frame.iter().position(|&b| b == t).map_or(total, |p| p + 1),
                });
            }
            end -= 1;
        }

        let width = rules.checksum.width();
        let cs_at = end - width;
        let received = if width == 2 {
            u16::from_le_bytes([frame[cs_at], frame[cs_at + 1]])
        } else {
            frame[cs_at] as u16
        };
        let computed = rules
            .checksum
            .compute(frame.get(rules.checksum_from..cs_at).unwrap_or(&[]));
        if received != computed {
            return Err(FrameError::ChecksumMismatch {
                expected: computed,
                actual: received,
            });
        }

        if let Some(p) = rules.postamble {
            if frame[cs_at - 1] != p {
                return Err(FrameError::Malformed(format!(
                    "missing postamble 0x{p:02X}"
                )));
            }
        }

        Ok(Parsed::Complete {
            payload: frame[fixed..fixed + payload_len].to_vec(),
            len: total,
        })
    }

    /// Parse exactly one device frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
        let (logical, _, _) = self.unstuff(bytes);
        match self.parse(&logical, self.reply_prefix(), self.reply_infix())? {
            Parsed::Complete { payload, len } if len == logical.len() => Ok(payload),
            Parsed::Complete { len, .. } => Err(FrameError::LengthMismatch {
                declared: len,
                actual: logical.len(),
            }),
            Parsed::Incomplete => Err(FrameError::LengthMismatch {
                declared: self.declared_len(&logical),
                actual: logical.len(),
            }),
        }
    }

    fn declared_len(&self, logical: &[u8]) -> usize {
        logical
            .get(self.reply_prefix().len())
            .map_or(self.reply_prefix().len() + 1, |&b| b as usize)
    }

    /// Pull the first complete device frame out of a receive buffer.
    ///
    /// Leading bytes that cannot start a frame are skipped. Returns the
    /// payload and the number of raw bytes consumed, or `None` while the
    /// frame is still incomplete.
    pub fn extract(&self, buffer: &[u8]) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
        let prefix = self.reply_prefix();
        let sync = prefix.first().copied();
        let start = match sync {
            Some(s) => match buffer.iter().position(|&b| b == s) {
                Some(p) => p,
                None => return Ok(None),
            },
            None => 0,
        };

        let (logical, ends, lone) = self.unstuff(&buffer[start..]);
        let failure = match self.parse(&logical, prefix, self.reply_infix()) {
            Ok(Parsed::Complete { payload, len }) => {
                return Ok(Some((payload, start + ends[len - 1])))
            }
            Ok(Parsed::Incomplete) => None,
            Err(e) => Some(e),
        };
        let Some(resync) = lone else {
            return failure.map_or(Ok(None), Err);
        };

        // An unescaped sync byte inside the frame may start a new one.
        match (self.extract(&buffer[start + resync..]), failure) {
            (Ok(Some((payload, consumed))), _) => Ok(Some((payload, start + resync + consumed))),
            (Ok(None), _) | (Err(_), None) => Ok(None),
            (Err(_), Some(e)) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ccnet_rules() -> CodecRules {
        CodecRules::new(&[0x02, 0x03], LengthRule::new(LengthScope::Frame), Checksum::Crc16Kermit)
    }

    fn ssp_rules() -> CodecRules {
        CodecRules::new(&[0x7F, 0x00], LengthRule::new(LengthScope::Payload), Checksum::Crc16Cms)
            .with_checksum_from(1)
            .with_stuffing(0x7F)
            .with_sequence_mask(0x80)
    }

    #[test]
    fn test_crc_check_values() {
        assert_eq!(crc16_kermit(b"123456789"), 0x2189);
        assert_eq!(crc16_cms(b"123456789"), 0xAEE7);
    }

    #[test]
    fn test_ccnet_reset_frame() {
        let codec = FrameCodec::new(ccnet_rules());
        let frame = codec.encode(&[0x30], &[]).unwrap();
        assert_eq!(frame, vec![0x02, 0x03, 0x06, 0x30, 0x41, 0xB3]);
        assert_eq!(codec.decode(&frame).unwrap(), vec![0x30]);
    }

    #[test]
    fn test_ssp_sync_frame() {
        let mut codec = FrameCodec::new(ssp_rules());
        codec.reset_sequence();
        let frame = codec.encode(&[0x11], &[]).unwrap();
        assert_eq!(frame, vec![0x7F, 0x80, 0x01, 0x11, 0x65, 0x82]);
    }

    #[test]
    fn test_additive_checksum_sums_to_zero() {
        let rules = CodecRules::new(&[0x02], LengthRule::adjusted(LengthScope::Payload, -1), Checksum::Additive)
            .with_infix(&[0x01], &[0x02]);
        let codec = FrameCodec::new(rules);
        let frame = codec.encode(&[0xFE], &[]).unwrap();
        assert_eq!(frame, vec![0x02, 0x00, 0x01, 0xFE, 0xFF]);
        let sum = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_xor_frame_with_offset() {
        let rules = CodecRules::new(&[0x02], LengthRule::new(LengthScope::Payload), Checksum::Xor)
            .with_checksum_from(1);
        let codec = FrameCodec::new(rules);
        let frame = codec.encode(&[0x10], &[0x1E, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frame, vec![0x02, 0x05, 0x10, 0x1E, 0x00, 0x00, 0x00, 0x0B]);
    }

    #[test]
    fn test_round_trip_and_single_byte_corruption() {
        let codec = FrameCodec::new(ccnet_rules());
        let payload = [0x34, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00];
        let frame = codec.encode(&payload[..1], &payload[1..]).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), payload.to_vec());

        for i in 3..3 + payload.len() {
            let mut corrupt = frame.clone();
            corrupt[i] ^= 0x5A;
            assert!(
                matches!(codec.decode(&corrupt), Err(FrameError::ChecksumMismatch { .. })),
                "byte {i} flip went undetected"
            );
        }
    }

    #[test]
    fn test_stuffing_round_trip() {
        let mut codec = FrameCodec::new(ssp_rules());
        codec.next_sequence();
        let payload = [0xF0, 0x7F, 0x01];
        let frame = codec.encode_reply(&payload).unwrap();
        assert!(frame.windows(2).any(|w| w == [0x7F, 0x7F]));
        assert_eq!(codec.decode(&frame).unwrap(), payload.to_vec());

        let (got, consumed) = codec.extract(&frame).unwrap().unwrap();
        assert_eq!(got, payload.to_vec());
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_unescaped_sync_in_payload_is_checksum_mismatch() {
        let codec = FrameCodec::new(ssp_rules());
        let mut frame = codec.encode_reply(&[0xF0, 0x7E, 0x01]).unwrap();
        assert_eq!(frame, vec![0x7F, 0x00, 0x03, 0xF0, 0x7E, 0x01, 0xC0, 0x10]);
        frame[4] = 0x7F;
        let err = codec.decode(&frame).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }), "{err:?}");
        assert!(codec.extract(&frame).is_err());
    }

    #[test]
    fn test_extract_resyncs_on_unescaped_sync() {
        let codec = FrameCodec::new(ssp_rules());
        let frame = codec.encode_reply(&[0xF0, 0x7E, 0x01]).unwrap();
        // a frame cut short by a new one
        let mut buf = frame[..4].to_vec();
        buf.extend_from_slice(&frame);
        let (payload, consumed) = codec.extract(&buf).unwrap().unwrap();
        assert_eq!(payload, vec![0xF0, 0x7E, 0x01]);
        assert_eq!(consumed, buf.len());

        assert!(codec.extract(&buf[..9]).unwrap().is_none());
    }

    #[test]
    fn test_sequence_echo_mismatch() {
        let mut codec = FrameCodec::new(ssp_rules());
        codec.next_sequence();
        let reply = codec.encode_reply(&[0xF0]).unwrap();
        codec.next_sequence();
        assert!(matches!(
            codec.decode(&reply),
            Err(FrameError::EchoMismatch { .. })
        ));
    }

    #[test]
    fn test_extract_partial_then_complete() {
        let codec = FrameCodec::new(ccnet_rules());
        let frame = codec.encode_reply(&[0x14]).unwrap();
        assert!(codec.extract(&frame[..3]).unwrap().is_none());

        let mut buf = vec![0xAA, 0x55];
        buf.extend_from_slice(&frame);
        buf.push(0x02);
        let (payload, consumed) = codec.extract(&buf).unwrap().unwrap();
        assert_eq!(payload, vec![0x14]);
        assert_eq!(consumed, 2 + frame.len());
    }

    #[test]
    fn test_truncated_frame_is_length_mismatch() {
        let codec = FrameCodec::new(ccnet_rules());
        let frame = codec.encode_reply(&[0x14, 0x00]).unwrap();
        assert!(matches!(
            codec.decode(&frame[..frame.len() - 1]),
            Err(FrameError::LengthMismatch { .. })
        ));
        assert!(matches!(
            codec.decode(&[0x02, 0x03, 0x02]),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_header_is_malformed() {
        let codec = FrameCodec::new(ccnet_rules());
        let mut frame = codec.encode_reply(&[0x14]).unwrap();
        frame[1] = 0x07;
        assert!(matches!(codec.decode(&frame), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_terminator_and_postamble() {
        let rules = CodecRules::new(&[0x01], LengthRule::adjusted(LengthScope::Body, 0x20), Checksum::Xor)
            .with_postamble(0x05)
            .with_checksum_from(1)
            .with_terminator(0x03);
        let codec = FrameCodec::new(rules);
        let frame = codec.encode(&[0x4A], &[0x31]).unwrap();
        assert_eq!(frame[1], 0x20 + 3);
        assert_eq!(*frame.last().unwrap(), 0x03);
        assert_eq!(codec.decode(&frame).unwrap(), vec![0x4A, 0x31]);

        let mut broken = frame.clone();
        let last = broken.len() - 1;
        broken[last] = 0x00;
        assert!(matches!(
            codec.decode(&broken),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let codec = FrameCodec::new(ccnet_rules());
        let data = vec![0u8; 300];
        assert!(matches!(
            codec.encode(&[0x3C], &data),
            Err(FrameError::Malformed(_))
        ));
    }
}
