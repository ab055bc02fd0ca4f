//! Hand-off between the reactor thread and the render workers.
//!
//! ```text
//!   reactor ──push──▶ DispatchQueue<TileRequest> ──pop──▶ workers
//!   reactor ◀─recv─── mpsc<RenderResult> + Waker ◀─send─── workers
//! ```
//!
//! Requests from one connection are pushed in decode order and popped in
//! FIFO order. Results come back over a channel whose every send also wakes
//! the reactor, since only the reactor writes to sockets.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use mio::Waker;

use crate::connection::{ConnectionId, ConnectionToken};
use crate::error::{Result, TileliteError};
use crate::protocol::{MessageType, Tile};
use crate::render::RenderError;

/// One unit of render work.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub kind: MessageType,
    pub tile: Tile,
    pub connection: ConnectionToken,
    /// Position of this request among its connection's requests.
    pub seq: u64,
    pub received_at: Instant,
}

impl TileRequest {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// Outcome of rendering one [`TileRequest`].
#[derive(Debug)]
pub struct RenderResult {
    pub kind: MessageType,
    pub connection: ConnectionToken,
    pub seq: u64,
    pub received_at: Instant,
    pub outcome: std::result::Result<Vec<u8>, RenderError>,
}

impl RenderResult {
    pub fn new(request: TileRequest, outcome: std::result::Result<Vec<u8>, RenderError>) -> Self {
        Self {
            kind: request.kind,
            connection: request.connection,
            seq: request.seq,
            received_at: request.received_at,
            outcome,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Why [`DispatchQueue::push`] handed the item back.
#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer, multi-consumer FIFO with an optional bound.
pub struct DispatchQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: Option<usize>,
}

impl<T> DispatchQueue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues without blocking.
    pub fn push(&self, item: T) -> std::result::Result<(), PushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if self.capacity.is_some_and(|cap| state.items.len() >= cap) {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Rejects further pushes and wakes every blocked consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Requests waiting for a worker.
    pub fn queued(&self) -> usize {
        self.lock().items.len()
    }
}

/// Sending half of the result channel. Each send wakes the reactor.
#[derive(Clone)]
pub struct ResultSender {
    sender: mpsc::Sender<RenderResult>,
    waker: Arc<Waker>,
}

impl ResultSender {
    pub fn send(&self, result: RenderResult) -> Result<()> {
        self.sender
            .send(result)
            .map_err(|_| TileliteError::QueueClosed)?;
        self.waker.wake()?;
        Ok(())
    }
}

pub fn result_channel(waker: Arc<Waker>) -> (ResultSender, mpsc::Receiver<RenderResult>) {
    let (sender, receiver) = mpsc::channel();
    (ResultSender { sender, waker }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::unbounded();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let popped: Vec<_> = (0..5).map(|_| queue.pop().unwrap()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let queue = DispatchQueue::new(Some(2));
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        match queue.push(3) {
            Err(PushError::Full(item)) => assert_eq!(item, 3),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(queue.try_pop(), Some(1));
        queue.push(3).unwrap();
        assert_eq!(queue.queued(), 2);
    }

    #[test]
    fn test_close_wakes_blocked_consumers() {
        let queue = Arc::new(DispatchQueue::<u32>::unbounded());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.close();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
        assert!(matches!(queue.push(1), Err(PushError::Closed(1))));
    }

    #[test]
    fn test_close_drains_remaining_items() {
        let queue = DispatchQueue::unbounded();
        queue.push("a").unwrap();
        queue.close();
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_consumers_take_each_item_once() {
        let queue = Arc::new(DispatchQueue::unbounded());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let popped = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let (queue, seen, popped) = (queue.clone(), seen.clone(), popped.clone());
                thread::spawn(move || {
                    while let Some(item) = queue.pop() {
                        seen.lock().unwrap().push(item);
                        popped.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for i in 0..1_000 {
            queue.push(i).unwrap();
        }
        while popped.load(Ordering::SeqCst) < 1_000 {
            thread::sleep(Duration::from_millis(5));
        }
        queue.close();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1_000);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 1_000);
    }

    #[test]
    fn test_result_send_wakes_poller() {
        use crate::connection::{ConnectionHandle, ConnectionId};
        use mio::{Events, Poll, Token};

        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (sender, receiver) = result_channel(waker);

        let request = TileRequest {
            kind: MessageType::TileRequest,
            tile: Tile::default(),
            connection: ConnectionHandle::new(ConnectionId(2)),
            seq: 0,
            received_at: Instant::now(),
        };
        sender.send(RenderResult::new(request, Ok(vec![1]))).unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(0)));

        let result = receiver.try_recv().unwrap();
        assert_eq!(result.connection_id(), ConnectionId(2));
        assert!(result.is_ok());
    }
}
