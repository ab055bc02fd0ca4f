use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use crate::dispatch::{DispatchQueue, RenderResult, ResultSender, TileRequest};
use crate::error::Result;
use crate::render::{RenderError, TileRenderer};
use crate::stats::ServerStats;

/// Fixed set of render workers draining one shared [`DispatchQueue`].
///
/// Workers never touch sockets. Each popped request is rendered and its
/// result handed to the reactor through the [`ResultSender`].
pub struct WorkerPool {
    workers: Vec<Worker>,
    queue: Arc<DispatchQueue<TileRequest>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        queue: Arc<DispatchQueue<TileRequest>>,
        renderer: Arc<dyn TileRenderer>,
        results: ResultSender,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(size),
            queue,
        };

        for id in 0..size.max(1) {
            let worker = Worker::spawn(
                id,
                Arc::clone(&pool.queue),
                Arc::clone(&renderer),
                results.clone(),
                Arc::clone(&stats),
            )?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue and waits for every worker to finish what was
    /// already queued.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::error!(worker = worker.id, "render worker exited by panic");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        queue: Arc<DispatchQueue<TileRequest>>,
        renderer: Arc<dyn TileRenderer>,
        results: ResultSender,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("tile-worker-{id}"))
            .spawn(move || {
                while let Some(request) = queue.pop() {
                    let outcome = render_one(renderer.as_ref(), &request);
                    if let Err(e) = &outcome {
                        stats.render_failed();
                        tracing::error!(
                            worker = id,
                            conn = %request.connection_id(),
                            tile = %request.tile,
                            error = %e,
                            "render failed"
                        );
                    }
                    if results.send(RenderResult::new(request, outcome)).is_err() {
                        // reactor is gone, nobody is left to write results
                        break;
                    }
                }
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

fn render_one(
    renderer: &dyn TileRenderer,
    request: &TileRequest,
) -> std::result::Result<Vec<u8>, RenderError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        renderer.render(request.kind, &request.tile)
    }))
    .unwrap_or_else(|payload| Err(RenderError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
