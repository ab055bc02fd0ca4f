//! # tilelite
//! The network core of a map tile server: a single reactor thread accepts
//! TCP connections, decodes MessagePack tile requests, and hands them to a
//! fixed pool of render workers. Rendered tiles (or failures) come back to
//! the reactor, which writes them to the originating connection.
//!
//! ## Core Philosophy
//! - **The reactor never blocks on rendering.** Decoding and enqueueing are
//!   proportional to bytes received; rendering happens on worker threads.
//! - **One writer per socket.** Workers never touch sockets. Results travel
//!   back over a channel and the reactor does every write.
//! - **A closed connection costs nothing downstream.** Requests carry a
//!   liveness token instead of the socket, so a result for a connection
//!   that has gone away is dropped without any access to freed state.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │ TileServer  │───▶│   Reactor    │───▶│   PollHandle     │
//! └─────────────┘    └──────────────┘    └──────────────────┘
//!                        │      ▲
//!                 decode │      │ RenderResult + Waker
//!                        ▼      │
//!               ┌───────────────┐    ┌──────────────────┐
//!               │ DispatchQueue │───▶│ WorkerPool       │──▶ TileRenderer
//!               └───────────────┘    └──────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use tilelite::{Config, PlaceholderRenderer, TileServer};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_pairs([("port", "9567"), ("threads", "4")])?;
//!     let server = TileServer::bind(&config, PlaceholderRenderer::new())?;
//!
//!     println!("listening on {}", server.local_addr());
//!     server.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`TileServer`]: binds, initializes the renderer, spawns workers, runs the reactor
//! - [`TileRenderer`]: the render collaborator workers call into
//! - [`protocol`]: request decoding and response encoding
//! - [`reactor`]: the readiness loop and its [`ShutdownHandle`]
//! - [`config`]: string-keyed configuration and its typed [`ServerConfig`] view
//! - [`error`]: error types and result handling

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod net;
pub mod poll;
pub mod protocol;
pub mod reactor;
pub mod render;
pub mod stats;
pub mod thread_pool;
pub mod writer;

use std::net::SocketAddr;
use std::sync::Arc;

pub use config::{Config, RenderAssets, ServerConfig};
pub use error::{Result, TileliteError};
pub use reactor::ShutdownHandle;
pub use render::{PlaceholderRenderer, RenderError, RenderFn, TileRenderer};
pub use stats::{ServerStats, StatsSnapshot};

use crate::dispatch::{result_channel, DispatchQueue};
use crate::poll::PollHandle;
use crate::reactor::{Reactor, ServerContext, WAKER};
use crate::thread_pool::WorkerPool;

/// Commonly used items in one import.
///
/// ```rust
/// use tilelite::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Config, ServerConfig};
    pub use crate::protocol::{MessageType, Tile};
    pub use crate::reactor::ShutdownHandle;
    pub use crate::render::{PlaceholderRenderer, RenderError, RenderFn, TileRenderer};
    pub use crate::stats::StatsSnapshot;
    pub use crate::TileServer;
}

/// A bound tile server, ready to run.
///
/// `bind` does everything that can fail at startup: it initializes the
/// renderer, validates the configuration, binds the listener and spawns the
/// workers. `run` then blocks on the reactor until a [`ShutdownHandle`]
/// stops it.
///
/// ## Example
///
/// ```rust,no_run
/// use std::thread;
/// use tilelite::{Config, PlaceholderRenderer, TileServer};
///
/// let config = Config::from_pairs([("port", "0"), ("host", "127.0.0.1")])?;
/// let server = TileServer::bind(&config, PlaceholderRenderer::new())?;
/// let shutdown = server.shutdown_handle();
///
/// let runner = thread::spawn(move || server.run());
/// // ... serve traffic ...
/// shutdown.shutdown();
/// runner.join().unwrap()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct TileServer {
    reactor: Reactor,
    pool: WorkerPool,
    stats: Arc<ServerStats>,
    config: Arc<ServerConfig>,
}

impl TileServer {
    /// Binds a server from a string-keyed [`Config`].
    ///
    /// ## Errors
    ///
    /// Returns an error if:
    /// - The renderer fails to initialize
    /// - An option is present but invalid
    /// - The listener cannot bind
    /// - A worker thread cannot be spawned
    pub fn bind<R: TileRenderer>(config: &Config, mut renderer: R) -> Result<Self> {
        renderer.initialize(config)?;
        let server_config = ServerConfig::try_from(config)?;
        Self::with_config(server_config, renderer)
    }

    /// Binds a server from an already typed [`ServerConfig`]. The renderer
    /// is used as is; [`TileRenderer::initialize`] is not called.
    pub fn with_config<R: TileRenderer>(config: ServerConfig, renderer: R) -> Result<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(ServerStats::new());
        let listener = net::bind_listener(config.address)?;
        let poll = PollHandle::new(WAKER)?;
        let (results, receiver) = result_channel(poll.waker());
        let queue = Arc::new(DispatchQueue::new(config.queue_depth));

        let pool = WorkerPool::new(
            config.threads,
            Arc::clone(&queue),
            Arc::new(renderer),
            results,
            Arc::clone(&stats),
        )?;

        let context = ServerContext {
            config: Arc::clone(&config),
            queue,
            stats: Arc::clone(&stats),
        };
        let reactor = Reactor::new(poll, listener, context, receiver)?;

        tracing::info!(
            addr = %reactor.local_addr(),
            threads = pool.workers_len(),
            queue_depth = ?config.queue_depth,
            ordered = config.ordered_responses,
            "tile server bound"
        );

        Ok(Self {
            reactor,
            pool,
            stats,
            config,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.reactor.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.reactor.shutdown_handle()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters that stay readable while [`run`](Self::run) blocks.
    pub fn stats_handle(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the reactor on the calling thread. On return the dispatch queue
    /// is closed, queued requests have drained through the workers, and
    /// every socket is released.
    pub fn run(mut self) -> Result<()> {
        let result = self.reactor.run();
        self.pool.shutdown();
        tracing::info!(stats = ?self.stats.snapshot(), "tile server stopped");
        result
    }
}
