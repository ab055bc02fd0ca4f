use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TileliteError};

pub const DEFAULT_PORT: u16 = 9567;
pub const DEFAULT_THREADS: usize = 1;
pub const DEFAULT_TILE_DB: &str = "tiles.db";
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_READ_BUDGET: usize = 64 * 1024;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Plugin and font locations handed to the renderer before the server
/// starts accepting connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderAssets {
    pub plugins: Option<PathBuf>,
    pub fonts: Option<PathBuf>,
}

/// Immutable, string-keyed server options.
///
/// Built once by [`Config::from_pairs`]. The keys the network core reads
/// (`threads`, `port`) are validated up front; every other key is kept as
/// an opaque string and can be read back with [`Config::get`]. The
/// `plugins` and `fonts` keys are split off into [`RenderAssets`] instead
/// of being stored as options.
#[derive(Debug, Clone)]
pub struct Config {
    options: BTreeMap<String, String>,
    assets: RenderAssets,
    threads: usize,
    port: u16,
}

impl Config {
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut options = BTreeMap::new();
        let mut assets = RenderAssets::default();

        for (key, value) in pairs {
            let (key, value) = (key.into(), value.into());
            match key.as_str() {
                "plugins" => assets.plugins = Some(PathBuf::from(value)),
                "fonts" => assets.fonts = Some(PathBuf::from(value)),
                _ => {
                    options.insert(key, value);
                }
            }
        }

        let defaults = [
            ("threads", DEFAULT_THREADS.to_string()),
            ("port", DEFAULT_PORT.to_string()),
            ("tile_db", DEFAULT_TILE_DB.to_string()),
        ];
        for (key, value) in defaults {
            options.entry(key.to_string()).or_insert(value);
        }

        let mut config = Self {
            options,
            assets,
            threads: DEFAULT_THREADS,
            port: DEFAULT_PORT,
        };
        config.threads = config.positive("threads")?.unwrap_or(DEFAULT_THREADS);
        config.port = config.parse("port")?.unwrap_or(DEFAULT_PORT);
        Ok(config)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path of the tile store. The core never opens it; it is passed
    /// through for the render collaborator.
    pub fn tile_db(&self) -> &str {
        self.get("tile_db").unwrap_or(DEFAULT_TILE_DB)
    }

    pub fn assets(&self) -> &RenderAssets {
        &self.assets
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses `key` with `FromStr`, returning `Ok(None)` when it is absent.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| TileliteError::invalid_option(key, raw, e.to_string())),
        }
    }

    pub fn positive(&self, key: &str) -> Result<Option<usize>> {
        match self.parse::<usize>(key)? {
            Some(0) => Err(TileliteError::invalid_option(
                key,
                self.get(key).unwrap_or_default(),
                "must be at least 1",
            )),
            other => Ok(other),
        }
    }

    pub fn flag(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(TileliteError::invalid_option(
                key,
                raw,
                "expected a boolean (true/false, yes/no, on/off, 1/0)",
            )),
        }
    }
}

/// Typed settings the server runs on.
///
/// Derived from a [`Config`] with `TryFrom`, or assembled directly with
/// [`ServerConfig::builder`].
///
/// ## Limits
///
/// - max_message_size: an undecoded buffer larger than this closes the connection
/// - read_budget: bytes read from one connection before the reactor moves on
/// - queue_depth: bound on queued tile requests (None for unbounded)
/// - max_connections: hard limit on concurrent connections (None for unlimited)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Number of render workers
    pub threads: usize,
    /// Size of the scratch buffer used for each read call
    pub read_buffer_size: usize,
    /// Bytes read from one connection per loop iteration
    pub read_budget: usize,
    /// Largest undecoded byte count tolerated per connection
    pub max_message_size: usize,
    /// Dispatch queue bound
    pub queue_depth: Option<usize>,
    /// Maximum number of connections
    pub max_connections: Option<usize>,
    /// Write responses in request order per connection
    pub ordered_responses: bool,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// Readiness events drained per poll
    pub events_capacity: usize,
    /// Upper bound on a single readiness wait
    pub poll_timeout: Duration,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(DEFAULT_HOST, DEFAULT_PORT),
            threads: DEFAULT_THREADS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_budget: DEFAULT_READ_BUDGET,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_depth: None,
            max_connections: None,
            ordered_responses: true,
            no_delay: true,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl TryFrom<&Config> for ServerConfig {
    type Error = TileliteError;

    fn try_from(config: &Config) -> Result<Self> {
        let host = config.parse::<IpAddr>("host")?.unwrap_or(DEFAULT_HOST);
        let mut builder = ServerConfig::builder()
            .address(SocketAddr::new(host, config.port()))
            .threads(config.threads());

        if let Some(size) = config.positive("read_buffer_size")? {
            builder = builder.read_buffer_size(size);
        }
        if let Some(budget) = config.positive("read_budget")? {
            builder = builder.read_budget(budget);
        }
        if let Some(size) = config.positive("max_message_size")? {
            builder = builder.max_message_size(size);
        }
        // `queue_depth = 0` spells out "unbounded"
        if let Some(depth) = config.parse::<usize>("queue_depth")? {
            builder = builder.queue_depth((depth > 0).then_some(depth));
        }
        if let Some(max) = config.positive("max_connections")? {
            builder = builder.max_connections(max);
        }
        if let Some(ordered) = config.flag("ordered_responses")? {
            builder = builder.ordered_responses(ordered);
        }
        if let Some(no_delay) = config.flag("no_delay")? {
            builder = builder.no_delay(no_delay);
        }
        if let Some(capacity) = config.positive("events_capacity")? {
            builder = builder.events_capacity(capacity);
        }
        if let Some(ms) = config.parse::<u64>("poll_timeout_ms")? {
            builder = builder.poll_timeout(Duration::from_millis(ms));
        }

        Ok(builder.build())
    }
}

/// Builder for ServerConfig.
///
/// Unset fields fall back to ServerConfig::default().
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    threads: Option<usize>,
    read_buffer_size: Option<usize>,
    read_budget: Option<usize>,
    max_message_size: Option<usize>,
    queue_depth: Option<Option<usize>>,
    max_connections: Option<usize>,
    ordered_responses: Option<bool>,
    no_delay: Option<bool>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn read_budget(mut self, budget: usize) -> Self {
        self.read_budget = Some(budget);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn queue_depth(mut self, depth: Option<usize>) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn ordered_responses(mut self, ordered: bool) -> Self {
        self.ordered_responses = Some(ordered);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            threads: self.threads.unwrap_or(default.threads).max(1),
            read_buffer_size: self
                .read_buffer_size
                .unwrap_or(default.read_buffer_size)
                .max(1),
            read_budget: self.read_budget.unwrap_or(default.read_budget).max(1),
            max_message_size: self.max_message_size.unwrap_or(default.max_message_size),
            queue_depth: self.queue_depth.unwrap_or(default.queue_depth),
            max_connections: self.max_connections.or(default.max_connections),
            ordered_responses: self.ordered_responses.unwrap_or(default.ordered_responses),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            events_capacity: self
                .events_capacity
                .unwrap_or(default.events_capacity)
                .max(1),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        Config::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_defaults_applied() {
        let config = config(&[]).unwrap();
        assert_eq!(config.threads(), 1);
        assert_eq!(config.port(), 9567);
        assert_eq!(config.tile_db(), "tiles.db");
        assert_eq!(config.get("threads"), Some("1"));
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let config = config(&[("threads", "8"), ("port", "7000"), ("tile_db", "/srv/t.db")]).unwrap();
        assert_eq!(config.threads(), 8);
        assert_eq!(config.port(), 7000);
        assert_eq!(config.tile_db(), "/srv/t.db");
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let config = config(&[("style", "osm-bright"), ("threads", "2")]).unwrap();
        assert_eq!(config.get("style"), Some("osm-bright"));
        assert!(config.iter().any(|(k, v)| k == "style" && v == "osm-bright"));
    }

    #[test]
    fn test_plugins_and_fonts_become_assets() {
        let config = config(&[("plugins", "/usr/lib/input"), ("fonts", "/usr/share/fonts")]).unwrap();
        assert_eq!(config.get("plugins"), None);
        assert_eq!(config.get("fonts"), None);
        assert_eq!(
            config.assets(),
            &RenderAssets {
                plugins: Some(PathBuf::from("/usr/lib/input")),
                fonts: Some(PathBuf::from("/usr/share/fonts")),
            }
        );
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = config(&[("threads", "0")]).unwrap_err();
        assert!(matches!(err, TileliteError::InvalidOption { ref key, .. } if key == "threads"));
    }

    #[test]
    fn test_bad_port_rejected() {
        assert!(config(&[("port", "70000")]).is_err());
        assert!(config(&[("port", "http")]).is_err());
    }

    #[test]
    fn test_server_config_from_config() {
        let config = config(&[
            ("host", "127.0.0.1"),
            ("port", "9000"),
            ("threads", "3"),
            ("queue_depth", "64"),
            ("max_message_size", "4096"),
            ("read_budget", "512"),
            ("ordered_responses", "off"),
            ("poll_timeout_ms", "20"),
        ])
        .unwrap();
        let server = ServerConfig::try_from(&config).unwrap();
        assert_eq!(server.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(server.threads, 3);
        assert_eq!(server.queue_depth, Some(64));
        assert_eq!(server.max_message_size, 4096);
        assert_eq!(server.read_budget, 512);
        assert!(!server.ordered_responses);
        assert_eq!(server.poll_timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_zero_queue_depth_is_unbounded() {
        let config = config(&[("queue_depth", "0")]).unwrap();
        let server = ServerConfig::try_from(&config).unwrap();
        assert_eq!(server.queue_depth, None);
    }

    #[test]
    fn test_bad_flag_rejected() {
        let config = config(&[("no_delay", "maybe")]).unwrap();
        assert!(ServerConfig::try_from(&config).is_err());
    }

    #[test]
    fn test_builder_clamps_threads() {
        let server = ServerConfig::builder().threads(0).build();
        assert_eq!(server.threads, 1);
        assert!(server.ordered_responses);
        assert_eq!(server.address.port(), DEFAULT_PORT);
    }
}
