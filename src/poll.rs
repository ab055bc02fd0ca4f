//! Readiness multiplexer.
//!
//! [`PollHandle`] is the only place the reactor touches the OS polling
//! facility. mio selects the backend for the target at build time (epoll on
//! Linux, kqueue on the BSDs and macOS), so the reactor sees one interface:
//! register, deregister, wait.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{event::Source, Events, Interest, Poll, Token, Waker};

use crate::error::Result;
use crate::event::Readiness;

pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    /// Creates the poller and a waker that reports readiness on `waker_token`.
    pub fn new(waker_token: Token) -> Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), waker_token)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poller.registry().register(src, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poller.registry().deregister(src)?;
        Ok(())
    }

    /// Waits for readiness and appends what was reported to `ready`.
    ///
    /// A wait interrupted by a signal reports nothing rather than failing.
    pub fn poll(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
        ready: &mut Vec<Readiness>,
    ) -> Result<usize> {
        match self.poller.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        let before = ready.len();
        ready.extend(events.iter().map(Readiness::from));
        Ok(ready.len() - before)
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    const WAKER: Token = Token(0);

    #[test]
    fn test_poll_times_out_empty() {
        let mut poller = PollHandle::new(WAKER).unwrap();
        let mut events = Events::with_capacity(16);
        let mut ready = Vec::new();
        let n = poller
            .poll(&mut events, Some(Duration::from_millis(10)), &mut ready)
            .unwrap();
        assert_eq!(n, 0);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wake_from_other_thread() {
        let mut poller = PollHandle::new(WAKER).unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let mut events = Events::with_capacity(16);
        let mut ready = Vec::new();
        poller
            .poll(&mut events, Some(Duration::from_secs(5)), &mut ready)
            .unwrap();
        handle.join().unwrap();

        assert!(ready.iter().any(|r| r.token() == WAKER));
    }

    #[test]
    fn test_listener_reports_readable() {
        let mut poller = PollHandle::new(WAKER).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        poller
            .register(&mut listener, Token(1), Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(16);
        let mut ready = Vec::new();
        poller
            .poll(&mut events, Some(Duration::from_secs(5)), &mut ready)
            .unwrap();
        assert!(ready.iter().any(|r| r.token() == Token(1) && r.is_readable()));

        poller.deregister(&mut listener).unwrap();
    }
}
