//! tilelite-server: serves rendered map tiles over TCP.
//!
//! Ships with [`PlaceholderRenderer`], so the binary is runnable without a
//! real map renderer linked in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilelite::{Config, PlaceholderRenderer, TileServer};

#[derive(Parser, Debug)]
#[command(name = "tilelite-server", version, about = "Map tile server")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, env = "TILELITE_PORT")]
    port: Option<u16>,

    /// Number of render workers
    #[arg(short, long, env = "TILELITE_THREADS")]
    threads: Option<usize>,

    /// Address to bind to
    #[arg(long, env = "TILELITE_HOST")]
    host: Option<String>,

    /// Path of the tile store handed to the renderer
    #[arg(long, env = "TILELITE_TILE_DB")]
    tile_db: Option<String>,

    /// Extra configuration as key=value, repeatable
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

impl Args {
    fn into_pairs(self) -> anyhow::Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for entry in &self.set {
            let Some((key, value)) = entry.split_once('=') else {
                bail!("--set expects KEY=VALUE, got {entry:?}");
            };
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        // explicit flags win over --set
        if let Some(port) = self.port {
            pairs.push(("port".into(), port.to_string()));
        }
        if let Some(threads) = self.threads {
            pairs.push(("threads".into(), threads.to_string()));
        }
        if let Some(host) = self.host {
            pairs.push(("host".into(), host));
        }
        if let Some(tile_db) = self.tile_db {
            pairs.push(("tile_db".into(), tile_db));
        }
        Ok(pairs)
    }
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn request_stop(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// SIGPIPE and SIGINT are ignored; SIGTERM asks the server to stop.
#[cfg(unix)]
fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, request_stop as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tilelite=info,tilelite_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Args::parse()) {
        tracing::error!(error = ?e, "tilelite-server failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    install_signal_handlers();

    let config = Config::from_pairs(args.into_pairs()?).context("invalid configuration")?;
    let server = TileServer::bind(&config, PlaceholderRenderer::new())
        .context("failed to start tile server")?;

    tracing::info!(
        address = %server.local_addr(),
        threads = config.threads(),
        tile_db = config.tile_db(),
        "tilelite-server v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = server.shutdown_handle();
    thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            while !STOP_REQUESTED.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
            tracing::info!("stop requested, shutting down");
            shutdown.shutdown();
        })
        .context("failed to spawn signal watcher")?;

    server.run().context("reactor failed")
}
