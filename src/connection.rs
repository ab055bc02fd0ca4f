//! Per-socket state owned by the reactor thread.
//!
//! ```text
//!   Connection (reactor only)               ConnectionHandle (shared)
//!   ┌──────────────────────────┐            ┌─────────────────────┐
//!   │ stream, peer             │   Arc      │ id                  │
//!   │ inbound  (undecoded)     │──────────▶│ alive: AtomicBool   │◀── TileRequest
//!   │ outbound (unwritten)     │            └─────────────────────┘◀── RenderResult
//!   │ responses (seq reorder)  │
//!   └──────────────────────────┘
//! ```
//!
//! The socket lives only in [`Connection`], which never leaves the reactor
//! thread. Requests and results carry a [`ConnectionToken`] instead, so a
//! worker can outlive the socket without ever being able to reach it. The
//! handle stays allocated for as long as any request references it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::protocol::{self, Decode, Frame, Framer};

/// Unique identifier for connections.
///
/// Ids are handed out in increasing order and never reused, so a late
/// result can never be mistaken for one belonging to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn token(&self) -> Token {
        Token(self.0 as usize)
    }

    pub fn from_token(token: Token) -> Self {
        ConnectionId(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Liveness record shared between a connection and its in-flight requests.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    alive: AtomicBool,
}

pub type ConnectionToken = Arc<ConnectionHandle>;

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> ConnectionToken {
        Arc::new(Self {
            id,
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Sequencing of responses on one connection.
///
/// Every decoded request takes the next sequence number. With ordering on,
/// a completed response is held until all earlier ones have been released;
/// with ordering off it is released as soon as it completes.
#[derive(Debug)]
pub struct ResponseQueue {
    ordered: bool,
    next_seq: u64,
    next_release: u64,
    held: BTreeMap<u64, Vec<u8>>,
    in_flight: BTreeSet<u64>,
}

impl ResponseQueue {
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            next_seq: 0,
            next_release: 0,
            held: BTreeMap::new(),
            in_flight: BTreeSet::new(),
        }
    }

    pub fn begin(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq);
        seq
    }

    /// Records the encoded response for `seq` and appends whatever became
    /// releasable to `out`. Unknown or repeated sequence numbers are ignored.
    pub fn complete(&mut self, seq: u64, frame: Vec<u8>, out: &mut Vec<u8>) {
        if !self.in_flight.remove(&seq) {
            return;
        }
        if !self.ordered {
            out.extend_from_slice(&frame);
            return;
        }
        self.held.insert(seq, frame);
        while let Some(frame) = self.held.remove(&self.next_release) {
            out.extend_from_slice(&frame);
            self.next_release += 1;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// No more reads; pending writes are flushed, then the socket is released.
    Closing,
}

/// Result of one bounded read pass over a readable socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
    /// The socket reported `WouldBlock` or end of stream. When false the
    /// pass stopped early and more data may be waiting without a new event.
    pub drained: bool,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    handle: ConnectionToken,
    state: ConnectionState,
    inbound: Vec<u8>,
    consumed: usize,
    framer: Framer,
    outbound: Vec<u8>,
    responses: ResponseQueue,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr, ordered: bool) -> Self {
        Self {
            stream,
            peer,
            handle: ConnectionHandle::new(id),
            state: ConnectionState::Open,
            inbound: Vec::new(),
            consumed: 0,
            framer: Framer::new(),
            outbound: Vec::new(),
            responses: ResponseQueue::new(ordered),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn handle(&self) -> ConnectionToken {
        Arc::clone(&self.handle)
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Reads until the socket would block, using `scratch` for each read.
    ///
    /// Stops early once `budget` bytes have been read in this pass or more
    /// than `limit` undecoded bytes are buffered.
    pub fn read_available(
        &mut self,
        scratch: &mut [u8],
        budget: usize,
        limit: usize,
    ) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        loop {
            if outcome.bytes >= budget || self.buffered() > limit {
                return Ok(outcome);
            }
            let want = scratch.len().min(budget - outcome.bytes);
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => {
                    outcome.eof = true;
                    outcome.drained = true;
                    return Ok(outcome);
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                    outcome.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    outcome.drained = true;
                    return Ok(outcome);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Decodes the next message from the undecoded bytes, consuming it on success.
    ///
    /// Bytes are only decoded once the framer has seen the whole message, so
    /// a message arriving in pieces is not re-parsed on every read.
    pub fn decode_next(&mut self) -> Decode {
        let pending = &self.inbound[self.consumed..];
        let len = match self.framer.advance(pending) {
            Frame::Pending => return Decode::Incomplete,
            Frame::Malformed(reason) => return Decode::Malformed(reason),
            Frame::Complete(len) => len,
        };
        self.framer.reset();
        let decoded = protocol::decode(&pending[..len]);
        if let Decode::Decoded(_, n) = decoded {
            self.consumed += n;
        }
        decoded
    }

    /// Drops decoded bytes from the front of the inbound buffer. The framer
    /// position is relative to the undecoded bytes, so it survives this.
    pub fn compact(&mut self) {
        if self.consumed > 0 {
            self.inbound.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Undecoded bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.inbound.len() - self.consumed
    }

    pub fn begin_request(&mut self) -> u64 {
        self.responses.begin()
    }

    pub fn complete_request(&mut self, seq: u64, frame: Vec<u8>) {
        self.responses.complete(seq, frame, &mut self.outbound);
    }

    pub fn in_flight(&self) -> usize {
        self.responses.in_flight()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Writes as much of the outbound buffer as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.outbound.len() {
                break Ok(());
            }
            match self.stream.write(&self.outbound[written..]) {
                Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.outbound.drain(..written);
        result
    }

    /// Stops reading and marks the connection dead; pending writes still drain.
    pub fn close(&mut self) {
        self.handle.mark_dead();
        self.state = ConnectionState::Closing;
        self.inbound.clear();
        self.consumed = 0;
        self.framer.reset();
    }

    /// Closes and discards anything not yet written.
    pub fn abort(&mut self) {
        self.close();
        self.outbound.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.mark_dead();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("buffered", &self.buffered())
            .field("scanned", &self.framer.scanned())
            .field("outbound", &self.outbound.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
