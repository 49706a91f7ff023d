//! Scripted transport used by the unit tests.

use super::transport::{PortSettings, Transport, TransportState};
use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One scripted read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    /// Bytes already sitting in the input buffer; `clear_input` drops them.
    Stale(Vec<u8>),
    Timeout,
}

/// Operation log entry, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Open,
    Close,
    Write(Vec<u8>),
    Read,
    Clear,
    Configure(u32),
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<MockRead> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    settings: PortSettings,
    reads: VecDeque<MockRead>,
    ops: Vec<MockOp>,
    responder: Option<Responder>,
    local_echo: bool,
}

/// Transport double that records every call and replays scripted reads.
///
/// Clones share state so a test can keep a handle after moving the
/// transport into a session.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn push_data(&self, bytes: &[u8]) -> &Self {
        self.lock().reads.push_back(MockRead::Data(bytes.to_vec()));
        self
    }

    pub fn push_stale(&self, bytes: &[u8]) -> &Self {
        self.lock().reads.push_back(MockRead::Stale(bytes.to_vec()));
        self
    }

    pub fn push_timeout(&self) -> &Self {
        self.lock().reads.push_back(MockRead::Timeout);
        self
    }

    /// Produce reads from each written frame instead of a fixed script.
    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Vec<MockRead> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Echo every written byte back, like a single-wire bus.
    pub fn set_local_echo(&self, on: bool) {
        self.lock().local_echo = on;
    }

    pub fn fail_open(&self) {
        self.lock().fail_open = true;
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.lock().ops.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn baud_history(&self) -> Vec<u32> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::Configure(baud) => Some(*baud),
                _ => None,
            })
            .collect()
    }

    pub fn pending_reads(&self) -> usize {
        self.lock().reads.len()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.ops.push(MockOp::Open);
        if s.fail_open {
            return Err(TransportError::Port("mock open failure".into()));
        }
        s.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.ops.push(MockOp::Close);
        s.open = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut s = self.lock();
        if !s.open {
            return Err(TransportError::NotOpen);
        }
        s.ops.push(MockOp::Write(data.to_vec()));
        if s.local_echo {
            s.reads.push_front(MockRead::Data(data.to_vec()));
        }
        if let Some(mut responder) = s.responder.take() {
            let replies = responder(data);
            s.reads.extend(replies);
            s.responder = Some(responder);
        }
        Ok(data.len())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut s = self.lock();
        if !s.open {
            return Err(TransportError::NotOpen);
        }
        s.ops.push(MockOp::Read);
        match s.reads.pop_front() {
            Some(MockRead::Data(bytes)) | Some(MockRead::Stale(bytes)) => Ok(bytes),
            Some(MockRead::Timeout) | None => {
                Err(TransportError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn configure(&mut self, settings: PortSettings) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.ops.push(MockOp::Configure(settings.baud_rate));
        s.settings = settings;
        Ok(())
    }

    fn settings(&self) -> PortSettings {
        self.lock().settings
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.ops.push(MockOp::Clear);
        s.reads.retain(|r| !matches!(r, MockRead::Stale(_)));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn state(&self) -> TransportState {
        if self.lock().open {
            TransportState::Open
        } else {
            TransportState::Closed
        }
    }

    fn description(&self) -> String {
        "Mock".into()
    }
}
