//! Readiness polling for transport endpoints
//!
//! Thin wrapper over a mio `Poll` owned by one runtime thread. Endpoints
//! register their socket with a token handed out here; `poll` returns the
//! tokens that became readable so the owner can route them.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Event loop shared by every endpoint of one runtime
pub struct EventLoop {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            next_token: 0,
        })
    }

    /// Hand out a token no other endpoint of this loop uses.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Wait for readiness and return the readable tokens.
    ///
    /// Registrations are edge-triggered: a returned endpoint must be drained
    /// until it would block. An interrupted wait yields no tokens.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Token>> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut tokens: Vec<Token> = self
            .events
            .iter()
            .filter(|event| event.is_readable() || event.is_read_closed())
            .map(|event| event.token())
            .collect();
        tokens.dedup();
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_tokens_are_unique() {
        let mut event_loop = EventLoop::new().unwrap();
        let first = event_loop.next_token();
        let second = event_loop.next_token();
        assert_ne!(first, second);
    }

    #[test]
    fn test_poll_reports_readable_token() {
        let mut event_loop = EventLoop::new().unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let token = event_loop.next_token();
        event_loop.register(local.as_raw_fd(), token).unwrap();

        let idle = event_loop.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(idle.is_empty());

        remote.write_all(b"x").unwrap();
        let ready = event_loop.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, vec![token]);

        event_loop.deregister(local.as_raw_fd()).unwrap();
    }
}
