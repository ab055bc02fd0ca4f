//! Delivery of render results to their connections.
//!
//! Runs on the reactor thread only. A result whose connection has closed,
//! or been replaced, is dropped here without touching any socket.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};
use crate::dispatch::RenderResult;
use crate::protocol::encode_response;
use crate::stats::ServerStats;

/// Map header, three keys, the type tag, the bool and the largest bin/str header.
const RESPONSE_OVERHEAD: usize = 1 + 5 + 3 + 8 + 1 + 1 + 5;

pub struct ResponseWriter {
    results: Receiver<RenderResult>,
    stats: Arc<ServerStats>,
}

impl ResponseWriter {
    pub fn new(results: Receiver<RenderResult>, stats: Arc<ServerStats>) -> Self {
        Self { results, stats }
    }

    /// Drains every pending result and flushes the connections that got
    /// new output. Returns the ids that were touched.
    pub fn drain(&mut self, connections: &mut HashMap<ConnectionId, Connection>) -> Vec<ConnectionId> {
        let mut touched = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(result) => {
                    if let Some(id) = self.deliver(result, connections) {
                        if !touched.contains(&id) {
                            touched.push(id);
                        }
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        for id in &touched {
            if let Some(conn) = connections.get_mut(id) {
                if let Err(e) = conn.flush() {
                    tracing::debug!(conn = %id, error = %e, "write failed, dropping connection");
                    conn.abort();
                }
            }
        }
        touched
    }

    /// Queues one result on its connection if that connection is still the
    /// one the request came from.
    pub fn deliver(
        &mut self,
        result: RenderResult,
        connections: &mut HashMap<ConnectionId, Connection>,
    ) -> Option<ConnectionId> {
        let id = result.connection_id();
        if !result.connection.is_alive() {
            self.discard(id, "connection closed");
            return None;
        }
        match connections.get_mut(&id) {
            Some(conn) if !conn.is_closing() => {
                self.write_to(conn, result);
                Some(id)
            }
            _ => {
                self.discard(id, "connection gone");
                None
            }
        }
    }

    /// Encodes `result` and hands it to the connection's response queue.
    /// Does not flush.
    pub fn write_to(&mut self, conn: &mut Connection, result: RenderResult) {
        let encoded = match &result.outcome {
            Ok(tile) => {
                let mut frame = Vec::with_capacity(tile.len() + RESPONSE_OVERHEAD);
                encode_response(result.kind, Ok(tile.as_slice()), &mut frame).map(|()| frame)
            }
            Err(e) => {
                let message = e.to_string();
                let mut frame = Vec::with_capacity(message.len() + RESPONSE_OVERHEAD);
                encode_response(result.kind, Err(message.as_str()), &mut frame).map(|()| frame)
            }
        };
        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conn = %conn.id(), error = %e, "failed to encode response");
                conn.abort();
                return;
            }
        };
        tracing::debug!(
            conn = %conn.id(),
            seq = result.seq,
            ok = result.is_ok(),
            bytes = frame.len(),
            elapsed_us = result.received_at.elapsed().as_micros() as u64,
            "response ready"
        );
        conn.complete_request(result.seq, frame);
        self.stats.response_written();
    }

    fn discard(&self, id: ConnectionId, reason: &str) {
        self.stats.result_discarded();
        tracing::debug!(conn = %id, reason, "discarding render result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::dispatch::TileRequest;
    use crate::protocol::{MessageType, Tile};
    use crate::render::RenderError;
    use mio::net::TcpStream;
    use std::io::Read;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn connection(id: u64) -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(ConnectionId(id), TcpStream::from_std(server), peer, true);
        (conn, client)
    }

    fn result_for(conn: &mut Connection, outcome: Result<Vec<u8>, RenderError>) -> RenderResult {
        let request = TileRequest {
            kind: MessageType::TileRequest,
            tile: Tile::default(),
            connection: conn.handle(),
            seq: conn.begin_request(),
            received_at: Instant::now(),
        };
        RenderResult::new(request, outcome)
    }

    fn read_response(client: &mut std::net::TcpStream) -> rmpv::Value {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        rmpv::decode::read_value(client).unwrap()
    }

    fn field<'a>(value: &'a rmpv::Value, key: &str) -> &'a rmpv::Value {
        value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
            .unwrap()
    }

    #[test]
    fn test_delivers_to_live_connection() {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(ServerStats::new());
        let mut writer = ResponseWriter::new(rx, Arc::clone(&stats));

        let (mut conn, mut client) = connection(2);
        tx.send(result_for(&mut conn, Ok(b"png".to_vec()))).unwrap();
        let mut connections = HashMap::from([(conn.id(), conn)]);

        assert_eq!(writer.drain(&mut connections), vec![ConnectionId(2)]);
        let response = read_response(&mut client);
        assert_eq!(field(&response, "ok").as_bool(), Some(true));
        assert_eq!(field(&response, "content").as_slice(), Some(&b"png"[..]));
        assert_eq!(stats.snapshot().written, 1);
    }

    #[test]
    fn test_failure_carries_message() {
        let (tx, rx) = mpsc::channel();
        let mut writer = ResponseWriter::new(rx, Arc::new(ServerStats::new()));

        let (mut conn, mut client) = connection(3);
        let failure = Err(RenderError::Failed("no style".into()));
        tx.send(result_for(&mut conn, failure)).unwrap();
        let mut connections = HashMap::from([(conn.id(), conn)]);
        writer.drain(&mut connections);

        let response = read_response(&mut client);
        assert_eq!(field(&response, "ok").as_bool(), Some(false));
        assert_eq!(
            field(&response, "content").as_str(),
            Some("render failed: no style")
        );
    }

    #[test]
    fn test_dead_connection_discards() {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(ServerStats::new());
        let mut writer = ResponseWriter::new(rx, Arc::clone(&stats));

        let (mut conn, _client) = connection(4);
        let result = result_for(&mut conn, Ok(vec![1]));
        drop(conn);
        tx.send(result).unwrap();

        let mut connections = HashMap::new();
        assert!(writer.drain(&mut connections).is_empty());
        assert_eq!(stats.snapshot().discarded, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_error_aborts_and_later_results_discard() {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(ServerStats::new());
        let mut writer = ResponseWriter::new(rx, Arc::clone(&stats));

        let (mut conn, client) = connection(6);
        let handle = conn.handle();
        let first = result_for(&mut conn, Ok(vec![0; 4096]));
        let second = result_for(&mut conn, Ok(vec![1]));

        crate::net::reset_on_drop(&client);
        drop(client);
        std::thread::sleep(Duration::from_millis(100));

        tx.send(first).unwrap();
        let mut connections = HashMap::from([(conn.id(), conn)]);
        assert_eq!(writer.drain(&mut connections), vec![ConnectionId(6)]);
        assert!(!handle.is_alive());
        let conn = &connections[&ConnectionId(6)];
        assert!(conn.is_closing());
        assert!(!conn.has_pending_writes());

        tx.send(second).unwrap();
        assert!(writer.drain(&mut connections).is_empty());
        assert_eq!(stats.snapshot().discarded, 1);
    }

    #[test]
    fn test_stale_handle_does_not_reach_new_connection() {
        let (_tx, rx) = mpsc::channel();
        let stats = Arc::new(ServerStats::new());
        let mut writer = ResponseWriter::new(rx, Arc::clone(&stats));

        // a live handle whose id is not in the map
        let orphan = ConnectionHandle::new(ConnectionId(99));
        let result = RenderResult::new(
            TileRequest {
                kind: MessageType::Prerender,
                tile: Tile::default(),
                connection: orphan,
                seq: 0,
                received_at: Instant::now(),
            },
            Ok(vec![1]),
        );
        let (conn, mut client) = connection(5);
        let mut connections = HashMap::from([(conn.id(), conn)]);
        assert_eq!(writer.deliver(result, &mut connections), None);
        assert_eq!(stats.snapshot().discarded, 1);

        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(client.read(&mut buf).is_err());
    }
}
