//! The ARTIM timer.
//!
//! After sending an A-RELEASE-RP or an A-ABORT,
//! the transport is only closed once the peer has closed its end
//! or the timer has expired,
//! so that the last PDU is not cut short while still in flight.
use std::time::{Duration, Instant};

use tracing::debug;

use super::transport::Transport;

/// The default ARTIM timeout.
pub const DEFAULT_ARTIM_TIMEOUT: Duration = Duration::from_millis(5000);

/// The default interval between checks for the peer's closure.
pub const DEFAULT_ARTIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Source of the current time for the timer.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The system's monotonic clock.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// How the wait for the transport's closure ended.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum ArtimOutcome {
    /// the peer closed the connection before the deadline
    PeerClosed,
    /// the deadline was reached
    Expired,
}

/// Association request/reject/release timer settings.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct ArtimTimer {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for ArtimTimer {
    fn default() -> Self {
        ArtimTimer {
            timeout: DEFAULT_ARTIM_TIMEOUT,
            poll_interval: DEFAULT_ARTIM_POLL_INTERVAL,
        }
    }
}

impl ArtimTimer {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        ArtimTimer {
            timeout,
            poll_interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the peer closes the transport or the timer expires,
    /// whichever comes first.
    ///
    /// Each check blocks on the transport for at most one poll interval,
    /// never past the deadline.
    /// A failing transport counts as closed.
    pub fn wait_for_close<T, C>(&self, transport: &mut T, clock: &C) -> ArtimOutcome
    where
        T: ?Sized + Transport,
        C: ?Sized + Clock,
    {
        let deadline = clock.now() + self.timeout;
        loop {
            let now = clock.now();
            if now >= deadline {
                debug!(timeout = ?self.timeout, "ARTIM timer expired");
                return ArtimOutcome::Expired;
            }
            let step = self.poll_interval.min(deadline - now);
            match transport.poll_peer_closed(step) {
                Ok(true) => return ArtimOutcome::PeerClosed,
                Ok(false) => {}
                Err(e) => {
                    debug!("Transport failed while waiting for closure: {}", e);
                    return ArtimOutcome::PeerClosed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::rc::Rc;

    /// A clock which only moves when told to.
    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Rc<Cell<Instant>>,
    }

    impl ManualClock {
        fn new() -> Self {
            ManualClock {
                now: Rc::new(Cell::new(Instant::now())),
            }
        }

        fn advance(&self, by: Duration) {
            self.now.set(self.now.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.now.get()
        }
    }

    /// A transport whose polls consume virtual time,
    /// closing after a given number of polls if any.
    struct FakeTransport {
        clock: ManualClock,
        polls: Vec<Duration>,
        close_after: Option<usize>,
        fail: bool,
    }

    impl Read for FakeTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FakeTransport {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for FakeTransport {
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn poll_peer_closed(&mut self, timeout: Duration) -> std::io::Result<bool> {
            if self.fail {
                return Err(std::io::ErrorKind::Other.into());
            }
            self.polls.push(timeout);
            if self.close_after == Some(self.polls.len()) {
                return Ok(true);
            }
            self.clock.advance(timeout);
            Ok(false)
        }

        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn transport(clock: &ManualClock, close_after: Option<usize>) -> FakeTransport {
        FakeTransport {
            clock: clock.clone(),
            polls: Vec::new(),
            close_after,
            fail: false,
        }
    }

    #[test]
    fn expires_after_timeout() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut transport = transport(&clock, None);

        let outcome = ArtimTimer::default().wait_for_close(&mut transport, &clock);
        assert_eq!(outcome, ArtimOutcome::Expired);
        assert_eq!(clock.now() - start, DEFAULT_ARTIM_TIMEOUT);
        assert_eq!(transport.polls.len(), 500);
        assert!(transport
            .polls
            .iter()
            .all(|d| *d == DEFAULT_ARTIM_POLL_INTERVAL));
    }

    #[test]
    fn exits_early_when_peer_closes() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut transport = transport(&clock, Some(3));

        let outcome = ArtimTimer::default().wait_for_close(&mut transport, &clock);
        assert_eq!(outcome, ArtimOutcome::PeerClosed);
        assert_eq!(transport.polls.len(), 3);
        assert_eq!(clock.now() - start, Duration::from_millis(20));
    }

    #[test]
    fn last_poll_does_not_pass_the_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut transport = transport(&clock, None);

        let timer = ArtimTimer::new(Duration::from_millis(25), Duration::from_millis(10));
        let outcome = timer.wait_for_close(&mut transport, &clock);
        assert_eq!(outcome, ArtimOutcome::Expired);
        assert_eq!(
            transport.polls,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(5)
            ]
        );
        assert_eq!(clock.now() - start, Duration::from_millis(25));
    }

    #[test]
    fn zero_timeout_does_not_poll() {
        let clock = ManualClock::new();
        let mut transport = transport(&clock, None);
        let timer = ArtimTimer::new(Duration::ZERO, Duration::from_millis(10));
        assert_eq!(
            timer.wait_for_close(&mut transport, &clock),
            ArtimOutcome::Expired
        );
        assert!(transport.polls.is_empty());
    }

    #[test]
    fn transport_failure_counts_as_closed() {
        let clock = ManualClock::new();
        let mut transport = transport(&clock, None);
        transport.fail = true;
        assert_eq!(
            ArtimTimer::default().wait_for_close(&mut transport, &clock),
            ArtimOutcome::PeerClosed
        );
    }
}
