use crate::payload::PAYLOAD_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default TCP port for both the server listener and client connections.
pub const DEFAULT_PORT: u16 = 7121;

/// Maximum length of the banner shown to the client, in characters.
pub const MAX_BANNER_LEN: usize = 60;

/// Test mode: client or server.
///
/// Determines whether this instance acts as a server (accepting connections)
/// or as a client (initiating connections and running the test sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming connections
    Server,
    /// Client mode - connects to a server and runs latency, download and upload tests
    Client,
}

/// Configuration for speedfish servers and clients.
///
/// A `Config` is built once at startup and never mutated afterwards; servers
/// share it read-only between all of their sessions. Use the builder methods
/// to customize it.
///
/// # Examples
///
/// ## Server with a banner
///
/// ```
/// use speedfish::Config;
///
/// let config = Config::server(":7121")
///     .with_cname("speed.example.net")
///     .with_location("Dallas, TX");
///
/// assert_eq!(config.cname.as_deref(), Some("speed.example.net"));
/// ```
///
/// ## Client with a shorter test
///
/// ```
/// use speedfish::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100")
///     .with_duration(Duration::from_secs(5))
///     .with_report_interval(Duration::from_millis(250));
///
/// assert_eq!(config.server_addr.as_deref(), Some("192.168.1.100"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Address the server listens on (`:7121` means every interface)
    pub listen_addr: String,

    /// Server to connect to, `host` or `host:port` (client mode)
    pub server_addr: Option<String>,

    /// Canonical server name reported in the handshake banner
    pub cname: Option<String>,

    /// Server location reported in the handshake banner
    pub location: Option<String>,

    /// Log every copied block and echoed byte
    pub debug: bool,

    /// Highest protocol version spoken (servers reject anything above it)
    pub protocol_version: u8,

    /// Nominal length of each throughput test
    pub duration: Duration,

    /// Extra time an inbound (receiving) copier waits for the sender
    pub inbound_grace: Duration,

    /// Number of payload bytes counted as one block tick
    pub block_size: usize,

    /// Interval between throughput samples
    pub report_interval: Duration,

    /// Number of echo round trips in a latency test
    pub ping_count: usize,

    /// Hard ceiling on the wall-clock length of a latency test
    pub ping_timeout: Duration,

    /// Number of throughput samples kept in the display history
    pub history_cap: usize,

    /// Capacity of the block tick queue between copier and sampler
    pub tick_queue: usize,

    /// How many samples and progress updates may wait for the presentation
    /// layer before newer ones are dropped
    pub event_queue: usize,

    /// Client timeout for connecting and completing the handshake
    pub connect_timeout: Duration,

    /// Print the final summary as JSON
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            listen_addr: format!(":{}", DEFAULT_PORT),
            server_addr: None,
            cname: None,
            location: None,
            debug: false,
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            duration: Duration::from_secs(10),
            inbound_grace: Duration::from_secs(2),
            block_size: 200 * 1024, // 200 KiB
            report_interval: Duration::from_millis(500),
            ping_count: 30,
            ping_timeout: Duration::from_secs(10),
            history_cap: 70,
            tick_queue: 200,
            event_queue: 256,
            connect_timeout: Duration::from_secs(10),
            json: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server configuration listening on `listen_addr`.
    ///
    /// The address may be `ip:port`, `host:port` or Go-style `:port`.
    pub fn server(listen_addr: impl Into<String>) -> Self {
        Self {
            mode: Mode::Server,
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Creates a client configuration for `server_addr` (`host[:port]`).
    pub fn client(server_addr: impl Into<String>) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr.into()),
            ..Default::default()
        }
    }

    /// Sets the canonical name the server reports in its banner.
    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    /// Sets the location the server reports in its banner.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Enables per-block and per-byte debug logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the protocol version this side speaks.
    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the nominal throughput test duration.
    ///
    /// # Examples
    ///
    /// ```
    /// use speedfish::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1").with_duration(Duration::from_secs(30));
    /// assert_eq!(config.duration, Duration::from_secs(30));
    /// ```
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the grace period added to inbound transfers.
    pub fn with_inbound_grace(mut self, grace: Duration) -> Self {
        self.inbound_grace = grace;
        self
    }

    /// Sets the block size used for tick accounting.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the throughput reporting interval.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Sets the number of echo rounds in the latency test.
    pub fn with_ping_count(mut self, count: usize) -> Self {
        self.ping_count = count;
        self
    }

    /// Sets the ceiling on total latency probing time.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Sets the number of throughput samples retained for display.
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Sets the client connect and handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables JSON summary output.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Checks the tunables for values the measurement engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block size must be non-zero".to_string()));
        }
        if self.block_size > PAYLOAD_SIZE {
            return Err(Error::Config(format!(
                "block size {} exceeds payload buffer of {} bytes",
                self.block_size, PAYLOAD_SIZE
            )));
        }
        if self.report_interval.is_zero() {
            return Err(Error::Config("report interval must be non-zero".to_string()));
        }
        if self.ping_count == 0 {
            return Err(Error::Config("ping count must be non-zero".to_string()));
        }
        if self.history_cap == 0 {
            return Err(Error::Config("history cap must be non-zero".to_string()));
        }
        if self.tick_queue == 0 || self.event_queue == 0 {
            return Err(Error::Config("queue capacities must be non-zero".to_string()));
        }
        if self.protocol_version > 9 {
            return Err(Error::Config(
                "protocol version must be a single decimal digit".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the listen address into something `TcpListener::bind` accepts.
    ///
    /// ```
    /// use speedfish::Config;
    ///
    /// assert_eq!(Config::server(":7121").bind_addr(), "0.0.0.0:7121");
    /// assert_eq!(Config::server("127.0.0.1:9000").bind_addr(), "127.0.0.1:9000");
    /// ```
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Returns the client target with the default port filled in.
    pub fn target_addr(&self) -> Result<String> {
        let server = self
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address is required for client mode".to_string()))?;
        Ok(with_default_port(server))
    }
}

/// Appends the default port to `host` unless it already carries one.
///
/// ```
/// use speedfish::config::with_default_port;
///
/// assert_eq!(with_default_port("example.net"), "example.net:7121");
/// assert_eq!(with_default_port("example.net:8000"), "example.net:8000");
/// assert_eq!(with_default_port("::1"), "[::1]:7121");
/// assert_eq!(with_default_port("[::1]:9000"), "[::1]:9000");
/// ```
pub fn with_default_port(host: &str) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    if host.starts_with('[') {
        return if host.contains("]:") {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_PORT)
        };
    }
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{}:{}", host, DEFAULT_PORT),
    }
}
