use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token, Waker};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::dispatch::{DispatchQueue, PushError, RenderResult, TileRequest};
use crate::error::Result;
use crate::event::Readiness;
use crate::net;
use crate::poll::PollHandle;
use crate::protocol::{Decode, Request};
use crate::render::RenderError;
use crate::stats::ServerStats;
use crate::writer::ResponseWriter;

pub const WAKER: Token = Token(0);
pub const LISTENER: Token = Token(1);
const FIRST_CONNECTION_ID: u64 = 2;

/// Everything the reactor shares with the rest of the server.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub queue: Arc<DispatchQueue<TileRequest>>,
    pub stats: Arc<ServerStats>,
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Single-threaded readiness loop. Owns the listener and every connection;
/// it is the only place sockets are read or written.
pub struct Reactor {
    poll: PollHandle,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
    context: ServerContext,
    writer: ResponseWriter,
    scratch: Vec<u8>,
    /// Connections whose last read stopped before `WouldBlock`. Readiness is
    /// edge triggered, so nothing else would bring them back.
    unfinished: Vec<ConnectionId>,
    running: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(
        poll: PollHandle,
        mut listener: TcpListener,
        context: ServerContext,
        results: Receiver<RenderResult>,
    ) -> Result<Self> {
        poll.register(&mut listener, LISTENER, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;
        let config = Arc::clone(&context.config);
        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            ready: Vec::with_capacity(config.events_capacity),
            listener,
            local_addr,
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION_ID,
            writer: ResponseWriter::new(results, Arc::clone(&context.stats)),
            context,
            scratch: vec![0; config.read_buffer_size],
            unfinished: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: self.poll.waker(),
        }
    }

    /// Runs until a [`ShutdownHandle`] stops it or the poller fails. The
    /// dispatch queue is closed and every socket released on the way out.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr, "reactor started");
        let result = self.event_loop();

        self.context.queue.close();
        for (id, mut conn) in self.connections.drain() {
            let _ = self.poll.deregister(conn.stream_mut());
            self.context.stats.connection_closed();
            tracing::debug!(conn = %id, "released on shutdown");
        }
        tracing::info!(addr = %self.local_addr, "reactor stopped");
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            let timeout = if self.unfinished.is_empty() {
                self.context.config.poll_timeout
            } else {
                Duration::ZERO
            };
            self.ready.clear();
            self.poll.poll(&mut self.events, Some(timeout), &mut self.ready)?;

            let revisit = std::mem::take(&mut self.unfinished);
            let ready = std::mem::take(&mut self.ready);
            for readiness in &ready {
                match readiness.token() {
                    WAKER => {}
                    LISTENER => self.accept(),
                    token => self.connection_ready(readiness, ConnectionId::from_token(token)),
                }
            }
            self.ready = ready;

            for id in revisit {
                if !self.unfinished.contains(&id) {
                    self.receive(id);
                    self.flush_and_settle(id);
                }
            }

            // results may arrive without a wake-up racing ahead of them
            for id in self.writer.drain(&mut self.connections) {
                self.settle(id);
            }
        }
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let config = &self.context.config;
        if let Some(max) = config.max_connections {
            if self.connections.len() >= max {
                self.context.stats.connection_refused();
                tracing::warn!(peer = %peer, max, "connection limit reached, refusing");
                return;
            }
        }

        net::configure_stream(&stream, config.no_delay);
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;

        if let Err(e) = self
            .poll
            .register(&mut stream, id.token(), Interest::READABLE | Interest::WRITABLE)
        {
            tracing::error!(peer = %peer, error = %e, "failed to register connection");
            return;
        }

        let conn = Connection::new(id, stream, peer, config.ordered_responses);
        self.connections.insert(id, conn);
        self.context.stats.connection_opened();
        tracing::info!(conn = %id, peer = %peer, "connection accepted");
    }

    fn connection_ready(&mut self, readiness: &Readiness, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        if readiness.is_error() {
            tracing::debug!(conn = %id, "socket error reported");
            conn.abort();
        }

        if readiness.is_readable() || readiness.is_closed() {
            self.receive(id);
        }
        self.flush_and_settle(id);
    }

    /// One bounded read pass on `id`, decoding and dispatching what arrived.
    fn receive(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_closing() {
            return;
        }

        let config = &self.context.config;
        match conn.read_available(&mut self.scratch, config.read_budget, config.max_message_size) {
            Ok(outcome) => {
                if outcome.bytes > 0 {
                    Self::process_inbound(conn, &self.context, &mut self.writer);
                }
                if outcome.eof && !conn.is_closing() {
                    tracing::debug!(conn = %id, "peer closed");
                    conn.close();
                } else if !outcome.drained && !conn.is_closing() && !self.unfinished.contains(&id) {
                    tracing::trace!(conn = %id, bytes = outcome.bytes, "read budget spent");
                    self.unfinished.push(id);
                }
            }
            Err(e) => {
                tracing::debug!(conn = %id, error = %e, "read failed");
                conn.close();
            }
        }
    }

    fn flush_and_settle(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.has_pending_writes() {
            if let Err(e) = conn.flush() {
                tracing::debug!(conn = %id, error = %e, "write failed");
                conn.abort();
            }
        }
        self.settle(id);
    }

    /// Decodes every complete message buffered on `conn` and dispatches it.
    fn process_inbound(conn: &mut Connection, context: &ServerContext, writer: &mut ResponseWriter) {
        loop {
            match conn.decode_next() {
                Decode::Decoded(request, _) => {
                    context.stats.request_decoded();
                    Self::dispatch(conn, request, context, writer);
                }
                Decode::Incomplete => break,
                Decode::Malformed(reason) => {
                    context.stats.malformed_input();
                    tracing::warn!(
                        conn = %conn.id(),
                        peer = %conn.peer(),
                        reason = %reason,
                        "malformed message, closing connection"
                    );
                    conn.close();
                    return;
                }
            }
        }

        conn.compact();
        let buffered = conn.buffered();
        if buffered > context.config.max_message_size {
            tracing::warn!(
                conn = %conn.id(),
                peer = %conn.peer(),
                bytes = buffered,
                limit = context.config.max_message_size,
                "undecoded input exceeds limit, closing connection"
            );
            conn.close();
        }
    }

    fn dispatch(
        conn: &mut Connection,
        request: Request,
        context: &ServerContext,
        writer: &mut ResponseWriter,
    ) {
        let seq = conn.begin_request();
        let request = TileRequest {
            kind: request.kind,
            tile: request.tile,
            connection: conn.handle(),
            seq,
            received_at: Instant::now(),
        };

        let (request, message) = match context.queue.push(request) {
            Ok(()) => {
                context.stats.request_dispatched();
                tracing::debug!(
                    conn = %conn.id(),
                    seq,
                    queued = context.queue.queued(),
                    "request dispatched"
                );
                return;
            }
            Err(PushError::Full(request)) => (request, "server busy"),
            Err(PushError::Closed(request)) => (request, "server shutting down"),
        };

        context.stats.request_rejected();
        tracing::warn!(
            conn = %conn.id(),
            seq,
            tile = %request.tile,
            reason = message,
            "rejecting request"
        );
        let result = RenderResult::new(request, Err(RenderError::Rejected(message.to_string())));
        writer.write_to(conn, result);
    }

    /// Releases `id` once it is closing with nothing left to write.
    fn settle(&mut self, id: ConnectionId) {
        let done = self
            .connections
            .get(&id)
            .is_some_and(|conn| conn.is_closing() && !conn.has_pending_writes());
        if !done {
            return;
        }
        if let Some(mut conn) = self.connections.remove(&id) {
            if let Err(e) = self.poll.deregister(conn.stream_mut()) {
                tracing::debug!(conn = %id, error = %e, "deregister failed");
            }
            self.context.stats.connection_closed();
            tracing::info!(
                conn = %id,
                peer = %conn.peer(),
                abandoned = conn.in_flight(),
                "connection closed"
            );
        }
    }
}
