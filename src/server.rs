use crate::config::Config;
use crate::copier::{CopyEnd, CopyReport, Direction, MeteredCopier};
use crate::latency::echo_responder;
use crate::payload::PayloadSource;
use crate::protocol::{self, ProtocolViolation, ServerBanner, TestKind};
use crate::reporter::EventReporter;
use crate::sampler::{SamplerReport, ThroughputSampler};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Speed test server.
///
/// The `Server` accepts connections and serves exactly one test per
/// connection: a download, an upload or an echo (latency) exchange. Every
/// connection runs in its own task and shares nothing with the others except
/// the read-only configuration and random payload.
///
/// # Examples
///
/// ```no_run
/// use speedfish::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(":7121")
///     .with_cname("speed.example.net")
///     .with_location("Dallas, TX");
///
/// let server = Server::new(config);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Arc<Config>,
    banner: Arc<ServerBanner>,
    payload: PayloadSource,
    cancellation_token: CancellationToken,
}

impl Server {
    /// Creates a server and fills its random payload buffer.
    pub fn new(config: Config) -> Self {
        let banner = ServerBanner::new(config.cname.as_deref(), config.location.as_deref());
        Self {
            config: Arc::new(config),
            banner: Arc::new(banner),
            payload: PayloadSource::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and every session in flight.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Banner sent in every handshake response.
    pub fn banner(&self) -> &ServerBanner {
        &self.banner
    }

    /// Binds the configured listen address and serves until cancelled.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            Error::Connection(format!("failed to listen on {}: {}", bind_addr, e))
        })?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until cancelled.
    ///
    /// Fails without accepting anything if the configuration is invalid.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.config.validate()?;
        info!("speedfish server listening on {}", listener.local_addr()?);
        match (&self.banner.cname, &self.banner.location) {
            (None, None) => info!("No server banner configured"),
            _ => info!("Banner: {}", self.banner.display_text()),
        }

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            debug!("New connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                warn!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
            }

            let mut session = ServerSession::new(
                self.config.clone(),
                self.banner.clone(),
                self.payload.clone(),
                addr.to_string(),
            )
            .with_cancellation(self.cancellation_token.child_token());

            tokio::spawn(async move {
                if let Err(e) = session.run(stream).await {
                    error!("Error handling client {}: {}", addr, e);
                }
            });
        }
        Ok(())
    }
}

/// Lifecycle of one server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    AwaitingCommand,
    Echoing,
    Transferring,
    Closed,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The request was refused with an `ERR:` line
    Rejected(ProtocolViolation),
    /// The client went away after the handshake without choosing a test
    ClientLeft,
    /// An echo test completed this many rounds
    Echoed(usize),
    /// A bulk transfer finished
    Transferred {
        kind: TestKind,
        copy: CopyReport,
        samples: SamplerReport,
    },
}

/// One accepted connection and the single test it serves.
pub struct ServerSession {
    config: Arc<Config>,
    banner: Arc<ServerBanner>,
    payload: PayloadSource,
    peer: String,
    cancel: CancellationToken,
    state: SessionState,
}

impl ServerSession {
    pub fn new(
        config: Arc<Config>,
        banner: Arc<ServerBanner>,
        payload: PayloadSource,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            config,
            banner,
            payload,
            peer: peer.into(),
            cancel: CancellationToken::new(),
            state: SessionState::Accepted,
        }
    }

    /// Ties the session to an outer token, usually a child of the server's.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    /// Drives the connection from handshake to close.
    ///
    /// Errors are only returned for failures while handshaking; once the
    /// handshake succeeded, a disconnect or transport error ends the session
    /// normally.
    pub async fn run<S>(&mut self, stream: S) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let outcome = self.serve(&mut stream).await;
        self.transition(SessionState::Closed);
        let _ = stream.shutdown().await;
        outcome
    }

    async fn serve<S>(&mut self, stream: &mut BufReader<S>) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(SessionState::Handshaking);
        let frame = protocol::read_frame(stream).await?.ok_or_else(|| {
            Error::Connection("client closed the connection before HELO".to_string())
        })?;
        if self.config.debug {
            debug!(
                "[{}] HELO received: {:?}",
                self.peer,
                String::from_utf8_lossy(&frame)
            );
        }
        let version = match protocol::parse_hello(&frame, self.config.protocol_version) {
            Ok(v) => v,
            Err(violation) => return self.reject(stream, violation).await,
        };
        stream.write_all(&self.banner.encode()).await?;
        stream.flush().await?;
        debug!("[{}] Handshake complete, protocol version {}", self.peer, version);

        self.transition(SessionState::AwaitingCommand);
        let frame = match protocol::read_frame(stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(SessionOutcome::ClientLeft),
            Err(e) => {
                debug!("[{}] Connection lost awaiting command: {}", self.peer, e);
                return Ok(SessionOutcome::ClientLeft);
            }
        };
        let kind = match protocol::parse_command(&frame) {
            Ok(kind) => kind,
            Err(violation) => return self.reject(stream, violation).await,
        };
        info!("[{}] Client requested {} test", self.peer, kind);

        match Direction::for_server(kind) {
            None => {
                self.transition(SessionState::Echoing);
                let rounds = tokio::select! {
                    _ = self.cancel.cancelled() => 0,
                    n = echo_responder(stream, self.config.ping_count, self.config.debug, &self.peer) => n,
                };
                info!("[{}] Echoed {} bytes", self.peer, rounds);
                Ok(SessionOutcome::Echoed(rounds))
            }
            Some(direction) => {
                self.transition(SessionState::Transferring);
                self.transfer(stream, kind, direction).await
            }
        }
    }

    async fn reject<S>(
        &mut self,
        stream: &mut BufReader<S>,
        violation: ProtocolViolation,
    ) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        warn!("[{}] {}", self.peer, violation);
        if let Err(e) = stream.write_all(&violation.error_line()).await {
            debug!("[{}] Could not send error line: {}", self.peer, e);
        }
        let _ = stream.flush().await;
        Ok(SessionOutcome::Rejected(violation))
    }

    async fn transfer<S>(
        &mut self,
        stream: &mut BufReader<S>,
        kind: TestKind,
        direction: Direction,
    ) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = &self.config;
        let (tick_tx, tick_rx) = mpsc::channel(config.tick_queue);
        let done = CancellationToken::new();
        let start = Instant::now();

        let sampler = ThroughputSampler::new(kind, config.block_size, config.report_interval)
            .with_history_cap(config.history_cap)
            .with_expected_duration(config.duration)
            .starting_at(start)
            .with_label(self.peer.clone());
        let sampler_task =
            tokio::spawn(sampler.run(tick_rx, done.clone(), EventReporter::disabled()));

        let copier = MeteredCopier::new(direction, config.block_size, config.duration)
            .with_grace(config.inbound_grace)
            .starting_at(start)
            .with_debug(config.debug)
            .with_label(self.peer.clone());
        let copy = copier
            .run(stream, &self.payload, tick_tx, &done, &self.cancel)
            .await;

        let samples = sampler_task
            .await
            .map_err(|e| Error::Test(format!("sampler task failed: {}", e)))?;

        let verb = match direction {
            Direction::Outbound => "Sent",
            Direction::Inbound => "Received",
        };
        info!(
            "[{}] {} {:.2} MB in {:.2}s ({:.2} Mbit/s, peak {:.2} Mbit/s)",
            self.peer,
            verb,
            copy.bytes as f64 / 1_000_000.0,
            copy.elapsed.as_secs_f64(),
            copy.bits_per_second() / 1_000_000.0,
            samples.stats.max / 1_000_000.0
        );
        if let CopyEnd::Failed(reason) = &copy.end {
            warn!("[{}] {} test ended early: {}", self.peer, kind, reason);
        }

        Ok(SessionOutcome::Transferred {
            kind,
            copy,
            samples,
        })
    }
}
