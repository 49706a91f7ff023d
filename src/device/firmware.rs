//! Chunked firmware transfer.
//!
//! The transfer runs inside one exclusive session lock:
//!
//! ```text
//! Idle -> BaudRaised -> HeadWritten -> BlockWriting(0..n) -> Exiting -> Idle
//!                 \___________\_______________\_______________\-> Failed
//! ```
//!
//! The line speed is raised for the transfer and the previous port settings
//! are restored on every exit path.

use super::command::CommandId;
use super::session::Link;
use super::transport::PortSettings;
use crate::error::CommandError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Wire parameters of a protocol's firmware loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareProfile {
    pub header_size: usize,
    pub block_size: usize,
    pub update_baud: u32,
    /// Block status byte meaning the device refused the block.
    pub block_error: u8,
    pub set_baud_answer: u8,
    pub head_answer: u8,
    pub exit_answer: u8,
}

impl Default for FirmwareProfile {
    fn default() -> Self {
        Self {
            header_size: 32,
            block_size: 128,
            update_baud: 115_200,
            block_error: 0xE0,
            set_baud_answer: 0x52,
            head_answer: 0x53,
            exit_answer: 0x54,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStage {
    Idle,
    BaudRaised,
    HeadWritten,
    BlockWriting(usize),
    Exiting,
    Failed,
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware update is not supported by this device")]
    Unsupported,

    #[error("image of {actual} bytes is shorter than the {header}-byte header")]
    ImageTooSmall { actual: usize, header: usize },

    #[error("unexpected answer to {command}: {answer:02X?}")]
    UnexpectedAnswer { command: CommandId, answer: Vec<u8> },

    #[error("block {expected} acknowledged as block {actual}")]
    BlockIndexMismatch { expected: u8, actual: u8 },

    #[error("device rejected block {0}")]
    BlockRejected(usize),

    #[error("firmware update cancelled")]
    Cancelled,

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub struct FirmwareUpdater<'a> {
    profile: &'a FirmwareProfile,
    update_baud: u32,
    stage: FirmwareStage,
}

impl<'a> FirmwareUpdater<'a> {
    pub fn new(profile: &'a FirmwareProfile, update_baud: Option<u32>) -> Self {
        Self {
            profile,
            update_baud: update_baud.unwrap_or(profile.update_baud),
            stage: FirmwareStage::Idle,
        }
    }

    pub fn stage(&self) -> FirmwareStage {
        self.stage
    }

    /// Number of blocks the image body is split into.
    pub fn block_count(&self, image: &[u8]) -> usize {
        image
            .len()
            .saturating_sub(self.profile.header_size)
            .div_ceil(self.profile.block_size)
    }

    /// Transfer `image`. `progress` receives (blocks written, total).
    pub fn run(
        &mut self,
        link: &mut Link<'_>,
        image: &[u8],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), FirmwareError> {
        if image.len() < self.profile.header_size {
            return Err(FirmwareError::ImageTooSmall {
                actual: image.len(),
                header: self.profile.header_size,
            });
        }

        let prior = link.port_settings();
        info!(
            "Firmware update: {} bytes, {} blocks @ {} baud",
            image.len(),
            self.block_count(image),
            self.update_baud
        );

        let result = self.transfer(link, image, prior.with_baud(self.update_baud), &mut progress);

        if let Err(e) = link.configure(prior) {
            error!("Failed to restore port settings after firmware update: {e}");
            if result.is_ok() {
                self.stage = FirmwareStage::Failed;
                return Err(e.into());
            }
        } else {
            debug!("Port restored to {} baud", prior.baud_rate);
        }

        match result {
            Ok(()) => {
                self.stage = FirmwareStage::Idle;
                info!("Firmware update complete");
                Ok(())
            }
            Err(e) => {
                warn!("Firmware update failed at {:?}: {e}", self.stage);
                self.stage = FirmwareStage::Failed;
                Err(e)
            }
        }
    }

    fn transfer(
        &mut self,
        link: &mut Link<'_>,
        image: &[u8],
        fast: PortSettings,
        progress: &mut impl FnMut(usize, usize),
    ) -> Result<(), FirmwareError> {
        let p = self.profile;

        let answer = link.execute_plain(CommandId::FirmwareSetBaud, &[])?;
        expect(CommandId::FirmwareSetBaud, &answer, p.set_baud_answer)?;
        link.configure(fast)?;
        self.stage = FirmwareStage::BaudRaised;

        let (header, body) = image.split_at(p.header_size);
        let mut head = (body.len() as u32).to_le_bytes().to_vec();
        head.extend_from_slice(header);
        let answer = link.execute_plain(CommandId::FirmwareHead, &head)?;
        expect(CommandId::FirmwareHead, &answer, p.head_answer)?;
        self.stage = FirmwareStage::HeadWritten;

        let total = self.block_count(image);
        for (i, chunk) in body.chunks(p.block_size).enumerate() {
            if link.is_cancelled() {
                return Err(FirmwareError::Cancelled);
            }
            self.stage = FirmwareStage::BlockWriting(i);

            let index = i as u8;
            let mut block = Vec::with_capacity(p.block_size + 1);
            block.push(index);
            block.extend_from_slice(chunk);
            block.resize(p.block_size + 1, 0);

            let answer = link.execute_plain(CommandId::FirmwareBlock, &block)?;
            let last = i + 1 == total;
            if last && answer == [p.exit_answer] {
                // the loader may leave with its answer to the last block
                progress(i + 1, total);
                return Ok(());
            }
            match answer[..] {
                [status, _] if status == p.block_error => return Err(FirmwareError::BlockRejected(i)),
                [_, echoed] if echoed != index => {
                    return Err(FirmwareError::BlockIndexMismatch {
                        expected: index,
                        actual: echoed,
                    })
                }
                [_, _] => {}
                _ => {
                    return Err(FirmwareError::UnexpectedAnswer {
                        command: CommandId::FirmwareBlock,
                        answer: answer.clone(),
                    })
                }
            }
            debug!("Firmware block {}/{} written", i + 1, total);
            progress(i + 1, total);

            if last {
                // otherwise it announces the exit in a frame of its own
                self.stage = FirmwareStage::Exiting;
                let answer = link.receive(CommandId::FirmwareExit)?;
                expect(CommandId::FirmwareExit, &answer, p.exit_answer)?;
            }
        }
        Ok(())
    }
}

fn expect(command: CommandId, answer: &[u8], code: u8) -> Result<(), FirmwareError> {
    if answer == [code] {
        Ok(())
    } else {
        Err(FirmwareError::UnexpectedAnswer {
            command,
            answer: answer.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::codec::FrameCodec;
    use crate::device::mock::{MockRead, MockTransport};
    use crate::device::protocols;
    use crate::device::session::{DeviceSession, SessionOptions};

    const HEADER: usize = 32;

    fn reply(payload: &[u8]) -> Vec<u8> {
        let d = protocols::find("ccnet").unwrap();
        FrameCodec::new(d.codec.clone()).encode_reply(payload).unwrap()
    }

    fn is_confirm(w: &[u8]) -> bool {
        w.len() == 6 && w[3] == 0x00
    }

    fn is_block(w: &[u8]) -> bool {
        w.len() > 100
    }

    /// Loader that answers every step; `block(i)` gives the frames sent
    /// back for block `i`.
    fn loader(mock: &MockTransport, mut block: impl FnMut(u8) -> Vec<Vec<u8>> + Send + 'static) {
        mock.respond_with(move |w| {
            if is_confirm(w) {
                return vec![];
            }
            let answers = if is_block(w) {
                block(w[3])
            } else {
                match w[3] {
                    0x51 => vec![vec![0x52]],
                    0x52 => vec![vec![0x53]],
                    _ => vec![vec![0x30]],
                }
            };
            answers
                .iter()
                .map(|a| MockRead::Data(reply(a)))
                .collect()
        });
    }

    /// Every block acknowledged; an Exit frame follows block `last`.
    fn acked(last: u8) -> impl FnMut(u8) -> Vec<Vec<u8>> + Send + 'static {
        move |i| {
            let mut frames = vec![vec![0x00, i]];
            if i == last {
                frames.push(vec![0x54]);
            }
            frames
        }
    }

    fn session(mock: &MockTransport) -> DeviceSession {
        let d = protocols::find("ccnet").unwrap();
        let s = DeviceSession::new(
            d,
            mock.boxed(),
            SessionOptions::from_config(d, &DeviceConfig::new("ccnet", "mock")),
        );
        s.open().unwrap();
        s
    }

    fn image(blocks: usize) -> Vec<u8> {
        (0..HEADER + blocks * 128 - 10).map(|i| i as u8).collect()
    }

    fn blocks_written(mock: &MockTransport) -> usize {
        mock.writes().iter().filter(|w| is_block(w)).count()
    }

    fn exit_sent(mock: &MockTransport) -> bool {
        mock.writes().iter().any(|w| w.len() == 6 && w[3] == 0x54)
    }

    #[test]
    fn test_successful_update() {
        let mock = MockTransport::new();
        loader(&mock, acked(2));
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let mut updater = FirmwareUpdater::new(&profile, None);
        let img = image(3);
        assert_eq!(updater.block_count(&img), 3);

        let mut seen = Vec::new();
        s.exclusive(|link| updater.run(link, &img, |done, total| seen.push((done, total))))
            .unwrap();

        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(updater.stage(), FirmwareStage::Idle);
        assert_eq!(blocks_written(&mock), 3);
        // the exit comes from the device, the host never sends one
        assert!(!exit_sent(&mock));
        assert_eq!(mock.pending_reads(), 0);
        assert_eq!(mock.baud_history(), vec![115_200, 9600]);

        // head carries the body length and the raw header
        let head = mock
            .writes()
            .into_iter()
            .find(|w| w.len() > 6 && w[3] == 0x52)
            .unwrap();
        let body_len = (img.len() - HEADER) as u32;
        assert_eq!(head[4..8], body_len.to_le_bytes());
        assert_eq!(head[8..8 + HEADER], img[..HEADER]);
    }

    #[test]
    fn test_last_block_is_zero_padded() {
        let mock = MockTransport::new();
        loader(&mock, acked(1));
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let img = image(2);
        s.exclusive(|link| FirmwareUpdater::new(&profile, None).run(link, &img, |_, _| {}))
            .unwrap();

        let last = mock.writes().into_iter().filter(|w| is_block(w)).last().unwrap();
        // header, index, 128 data bytes, crc
        assert_eq!(last.len(), 3 + 129 + 2);
        assert_eq!(last[3], 1);
        assert!(last[4 + 118..4 + 128].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exit_answered_to_last_block() {
        let mock = MockTransport::new();
        loader(&mock, |i| if i == 1 { vec![vec![0x54]] } else { vec![vec![0x00, i]] });
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let mut seen = Vec::new();
        s.exclusive(|link| {
            FirmwareUpdater::new(&profile, None).run(link, &image(2), |done, total| seen.push((done, total)))
        })
        .unwrap();

        assert_eq!(seen, vec![(1, 2), (2, 2)]);
        assert!(!exit_sent(&mock));
        assert_eq!(mock.baud_history(), vec![115_200, 9600]);
    }

    #[test]
    fn test_missing_exit_frame_fails() {
        let mock = MockTransport::new();
        loader(&mock, |i| vec![vec![0x00, i]]);
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let mut updater = FirmwareUpdater::new(&profile, None);

        let err = s
            .exclusive(|link| updater.run(link, &image(1), |_, _| {}))
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Command(_)), "{err}");
        assert_eq!(updater.stage(), FirmwareStage::Failed);
        assert!(!exit_sent(&mock));
        assert_eq!(mock.baud_history().last(), Some(&9600));
    }

    #[test]
    fn test_rejected_block_stops_and_restores_baud() {
        let mock = MockTransport::new();
        loader(&mock, |i| if i == 1 { vec![vec![0xE0, i]] } else { vec![vec![0x00, i]] });
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let mut updater = FirmwareUpdater::new(&profile, None);

        let err = s
            .exclusive(|link| updater.run(link, &image(4), |_, _| {}))
            .unwrap_err();
        assert!(matches!(err, FirmwareError::BlockRejected(1)));
        assert_eq!(updater.stage(), FirmwareStage::Failed);
        assert_eq!(blocks_written(&mock), 2);
        assert!(!exit_sent(&mock));
        assert_eq!(mock.baud_history().last(), Some(&9600));
    }

    #[test]
    fn test_block_index_mismatch() {
        let mock = MockTransport::new();
        loader(&mock, |i| vec![vec![0x00, i.wrapping_add(1)]]);
        let s = session(&mock);
        let profile = FirmwareProfile::default();

        let err = s
            .exclusive(|link| FirmwareUpdater::new(&profile, None).run(link, &image(2), |_, _| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::BlockIndexMismatch {
                expected: 0,
                actual: 1
            }
        ));
        assert!(!exit_sent(&mock));
    }

    #[test]
    fn test_unexpected_set_baud_answer_keeps_speed() {
        let mock = MockTransport::new();
        mock.respond_with(|w| {
            if is_confirm(w) {
                vec![]
            } else {
                vec![MockRead::Data(reply(&[0x99]))]
            }
        });
        let s = session(&mock);
        let profile = FirmwareProfile::default();

        let err = s
            .exclusive(|link| FirmwareUpdater::new(&profile, None).run(link, &image(1), |_, _| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::UnexpectedAnswer {
                command: CommandId::FirmwareSetBaud,
                ..
            }
        ));
        assert_eq!(mock.baud_history(), vec![9600]);
    }

    #[test]
    fn test_cancel_between_blocks() {
        let mock = MockTransport::new();
        loader(&mock, acked(2));
        let s = session(&mock);
        let token = s.cancel_token();
        let profile = FirmwareProfile::default();

        let err = s
            .exclusive(|link| {
                FirmwareUpdater::new(&profile, None).run(link, &image(3), |done, _| {
                    if done == 1 {
                        token.cancel();
                    }
                })
            })
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Cancelled));
        assert_eq!(blocks_written(&mock), 1);
        assert_eq!(mock.baud_history().last(), Some(&9600));
    }

    #[test]
    fn test_model_baud_overrides_profile() {
        let mock = MockTransport::new();
        loader(&mock, acked(0));
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        s.exclusive(|link| FirmwareUpdater::new(&profile, Some(57_600)).run(link, &image(1), |_, _| {}))
            .unwrap();
        assert_eq!(mock.baud_history(), vec![57_600, 9600]);
    }

    #[test]
    fn test_image_shorter_than_header() {
        let mock = MockTransport::new();
        let s = session(&mock);
        let profile = FirmwareProfile::default();
        let err = s
            .exclusive(|link| FirmwareUpdater::new(&profile, None).run(link, &[0u8; 8], |_, _| {}))
            .unwrap_err();
        assert!(matches!(err, FirmwareError::ImageTooSmall { actual: 8, header: 32 }));
        assert!(mock.writes().is_empty());
    }
}
