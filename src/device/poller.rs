//! Status polling and bounded waits.

use super::session::DeviceSession;
use super::status::{StatusCode, StatusCodeSet, StatusLevel};
use crate::error::CommandError;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default pause between polls inside a bounded wait.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything that can issue one status poll.
pub trait StatusSource {
    fn poll_once(&self) -> Result<StatusCodeSet, CommandError>;
}

impl StatusSource for DeviceSession {
    fn poll_once(&self) -> Result<StatusCodeSet, CommandError> {
        self.exclusive(|link| link.poll_status())
    }
}

/// Poll until `predicate` holds or `timeout` elapses.
///
/// Errors from the poll itself end the wait. At least one poll is always
/// made, even with a zero timeout.
pub fn wait_for<S, P>(
    source: &S,
    timeout: Duration,
    interval: Duration,
    predicate: P,
) -> Result<StatusCodeSet, CommandError>
where
    S: StatusSource + ?Sized,
    P: Fn(&StatusCodeSet) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let status = source.poll_once()?;
        if predicate(&status) {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            debug!("Wait gave up, last status {:?}", status);
            return Err(CommandError::WaitTimeout(timeout.as_millis() as u64));
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

pub fn is_ready(status: &StatusCodeSet) -> bool {
    status.is_available() && status.level() < StatusLevel::Busy
}

pub fn is_escrow_settled(status: &StatusCodeSet) -> bool {
    ![StatusCode::Escrow, StatusCode::Stacking, StatusCode::Returning]
        .into_iter()
        .any(|c| status.contains(c))
}

pub fn wait_until_ready<S: StatusSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<StatusCodeSet, CommandError> {
    wait_for(source, timeout, WAIT_POLL_INTERVAL, is_ready)
}

pub fn wait_until_not_busy<S: StatusSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<StatusCodeSet, CommandError> {
    wait_for(source, timeout, WAIT_POLL_INTERVAL, |s| !s.is_busy())
}

pub fn wait_until_escrow_settled<S: StatusSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<StatusCodeSet, CommandError> {
    wait_for(source, timeout, WAIT_POLL_INTERVAL, is_escrow_settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::codec::FrameCodec;
    use crate::device::mock::MockTransport;
    use crate::device::protocols;
    use crate::device::session::SessionOptions;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Hands out a fixed sequence of statuses, then repeats the last one.
    struct Script(RefCell<VecDeque<StatusCodeSet>>);

    impl Script {
        fn new(codes: &[StatusCode]) -> Self {
            Self(RefCell::new(codes.iter().map(|&c| StatusCodeSet::single(c)).collect()))
        }

        fn remaining(&self) -> usize {
            self.0.borrow().len()
        }
    }

    impl StatusSource for Script {
        fn poll_once(&self) -> Result<StatusCodeSet, CommandError> {
            let mut q = self.0.borrow_mut();
            match q.len() {
                0 => Err(CommandError::Transport("script exhausted".into())),
                1 => Ok(q[0].clone()),
                _ => Ok(q.pop_front().unwrap_or_default()),
            }
        }
    }

    #[test]
    fn test_wait_until_ready() {
        let s = Script::new(&[StatusCode::PowerUp, StatusCode::Initializing, StatusCode::Enabled]);
        let status = wait_until_ready(&s, Duration::from_secs(2)).unwrap();
        assert!(status.contains(StatusCode::Enabled));
        assert_eq!(s.remaining(), 1);
    }

    #[test]
    fn test_warning_counts_as_ready() {
        let s = Script::new(&[StatusCode::Disabled]);
        assert!(wait_until_ready(&s, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_wait_times_out() {
        let s = Script::new(&[StatusCode::Printing]);
        let started = Instant::now();
        let err = wait_until_not_busy(&s, Duration::from_millis(250)).unwrap_err();
        assert_eq!(err, CommandError::WaitTimeout(250));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_poll_error_ends_wait() {
        let s = Script::new(&[]);
        let err = wait_until_ready(&s, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_escrow_settled() {
        let s = Script::new(&[StatusCode::Escrow, StatusCode::Stacking, StatusCode::Stacked]);
        let status = wait_until_escrow_settled(&s, Duration::from_secs(2)).unwrap();
        assert!(status.contains(StatusCode::Stacked));
    }

    #[test]
    fn test_not_available_is_never_ready() {
        assert!(!is_ready(&StatusCodeSet::not_available()));
        assert!(!is_ready(&StatusCodeSet::single(StatusCode::StackerOpen)));
        assert!(is_ready(&StatusCodeSet::ok()));
    }

    #[test]
    fn test_session_poll_decodes_answer() {
        let d = protocols::find("ccnet").unwrap();
        let mock = MockTransport::new();
        let answer = FrameCodec::new(d.codec.clone())
            .encode_reply(&[0x80, 0x02])
            .unwrap();
        mock.push_data(&answer);
        let session = DeviceSession::new(
            d,
            mock.boxed(),
            SessionOptions::from_config(d, &DeviceConfig::new("ccnet", "mock")),
        );
        session.open().unwrap();

        let status = session.poll_once().unwrap();
        assert!(status.contains(StatusCode::Escrow));
        assert_eq!(status.detail(StatusCode::Escrow), Some(2));
    }
}
