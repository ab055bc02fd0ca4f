use mio::{event::Event, Token};
use std::fmt;

/// Readiness report for one registered source, detached from the backend's
/// event type so it can outlive the event buffer it was read from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_closed: bool,
    is_error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_closed", &self.is_closed)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    /// Peer hung up in either direction.
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_closed: event.is_read_closed() || event.is_write_closed(),
            is_error: event.is_error(),
        }
    }
}
