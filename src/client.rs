use crate::config::{Config, Mode};
use crate::copier::{CopyEnd, Direction, MeteredCopier};
use crate::latency::LatencyProber;
use crate::measurements::{LatencyResult, MeasurementsCollector, ThroughputResult};
use crate::payload::PayloadSource;
use crate::protocol::{self, TestKind};
use crate::reporter::{run_reporter_task, EventReporter, ProgressCallback, ProgressEvent};
use crate::sampler::ThroughputSampler;
use crate::{Error, Result};
use log::{debug, info};
use std::future::Future;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

type CallbackRef = Arc<dyn ProgressCallback>;

/// Order in which a run executes its tests.
///
/// Latency comes first so its results are on screen while the throughput
/// tests are still filling their graphs.
pub const TEST_SEQUENCE: [TestKind; 3] = [TestKind::Echo, TestKind::Download, TestKind::Upload];

/// Speed test client.
///
/// A run performs a latency test, a download test and an upload test, in
/// that order, each over its own connection. Any connection, handshake or
/// transport failure aborts the whole run; nothing is retried.
///
/// # Examples
///
/// ```no_run
/// use speedfish::{Client, Config, ProgressEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("speed.example.net")
///     .with_duration(Duration::from_secs(5));
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         if let ProgressEvent::Throughput { sample, .. } = event {
///             println!("{}: {:.2} Mbit/s", sample.kind, sample.bits_per_second / 1e6);
///         }
///     });
///
/// client.run().await?;
/// println!("{}", client.get_measurements().summary());
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Arc<Config>,
    target: String,
    payload: PayloadSource,
    measurements: MeasurementsCollector,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is not a client configuration
    /// with a server address, or if any tunable is out of range.
    ///
    /// ```
    /// use speedfish::{Client, Config};
    ///
    /// assert!(Client::new(Config::client("127.0.0.1")).is_ok());
    /// assert!(Client::new(Config::server(":7121")).is_err());
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Client {
            return Err(Error::Config("Client requires a client configuration".to_string()));
        }
        config.validate()?;
        let target = config.target_addr()?;

        Ok(Self {
            config: Arc::new(config),
            target,
            payload: PayloadSource::new(),
            measurements: MeasurementsCollector::new(),
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback, driven from the event queue by its own task.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it aborts the run: the connection in use is dropped, the
    /// sampler is joined and `run` returns an error.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Server address with the port filled in.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Runs the full test sequence, delivering events to the callback if set.
    pub async fn run(&self) -> Result<()> {
        let Some(callback) = self.callback.clone() else {
            return self.run_with_reporter(EventReporter::disabled()).await;
        };

        let (reporter, receiver) = EventReporter::new(self.config.event_queue);
        let reporter_task = tokio::spawn(run_reporter_task(receiver, callback));
        let result = self.run_with_reporter(reporter).await;
        let _ = reporter_task.await;
        result
    }

    /// Runs the full test sequence, pushing events into `reporter`.
    ///
    /// The caller owns the receiving end; it sees the queue close once this
    /// returns.
    pub async fn run_with_reporter(&self, reporter: EventReporter) -> Result<()> {
        info!("Connecting to speedfish server at {}", self.target);
        self.measurements.start(&self.target);

        let result = self.run_sequence(&reporter).await;
        if let Err(e) = &result {
            reporter.emit(ProgressEvent::Error(e.to_string()));
        }
        if reporter.dropped() > 0 {
            debug!(
                "Event consumer fell behind; {} sample events dropped",
                reporter.dropped()
            );
        }
        result
    }

    async fn run_sequence(&self, reporter: &EventReporter) -> Result<()> {
        for kind in TEST_SEQUENCE {
            reporter.emit(ProgressEvent::TestStarted(kind));
            reporter.emit(ProgressEvent::TestProgress {
                kind,
                fraction: 0.0,
            });

            match Direction::for_client(kind) {
                None => self.run_latency(reporter).await?,
                Some(direction) => self.run_throughput(kind, direction, reporter).await?,
            }

            reporter.emit(ProgressEvent::TestCompleted(kind));
        }
        Ok(())
    }

    async fn run_latency(&self, reporter: &EventReporter) -> Result<()> {
        let mut stream = self.open(TestKind::Echo, reporter).await?;

        let prober = LatencyProber::new(self.config.ping_count, self.config.ping_timeout)
            .with_debug(self.config.debug);
        let report = prober
            .probe(&mut stream, &self.cancellation_token, reporter.clone())
            .await?;
        drop(stream);

        if let Some(stats) = report.stats {
            info!(
                "Latency: {:.2} ms avg over {} rounds",
                stats.mean_us / 1000.0,
                stats.count
            );
        }
        self.measurements.record_latency(LatencyResult::from(report));
        Ok(())
    }

    async fn run_throughput(
        &self,
        kind: TestKind,
        direction: Direction,
        reporter: &EventReporter,
    ) -> Result<()> {
        let config = &self.config;
        let mut stream = self.open(kind, reporter).await?;

        let (tick_tx, tick_rx) = mpsc::channel(config.tick_queue);
        let done = CancellationToken::new();
        let start = Instant::now();
        let sampler = ThroughputSampler::new(kind, config.block_size, config.report_interval)
            .with_history_cap(config.history_cap)
            .with_expected_duration(config.duration)
            .starting_at(start)
            .with_label(self.target.clone());
        let sampler_task = tokio::spawn(sampler.run(tick_rx, done.clone(), reporter.clone()));

        let copier = MeteredCopier::new(direction, config.block_size, config.duration)
            .with_grace(config.inbound_grace)
            .starting_at(start)
            .with_debug(config.debug)
            .with_label(self.target.clone());
        let copy = copier
            .run(
                &mut stream,
                &self.payload,
                tick_tx,
                &done,
                &self.cancellation_token,
            )
            .await;
        drop(stream);

        let sampled = sampler_task
            .await
            .map_err(|e| Error::Test(format!("sampler task failed: {}", e)))?;

        match &copy.end {
            CopyEnd::Aborted => return Err(Error::Test(format!("{} test cancelled", kind))),
            CopyEnd::Failed(reason) => {
                return Err(Error::Connection(format!("{} test failed: {}", kind, reason)))
            }
            CopyEnd::Deadline | CopyEnd::PeerClosed => {}
        }

        let result = ThroughputResult::from_reports(kind, &copy, &sampled);
        info!(
            "{}: {:.2} Mbit/s over {:.2}s",
            kind,
            result.bits_per_second() / 1_000_000.0,
            result.duration.as_secs_f64()
        );
        self.measurements.record_throughput(result);
        reporter.emit(ProgressEvent::TestProgress {
            kind,
            fraction: 1.0,
        });
        Ok(())
    }

    /// Connects, handshakes and selects `kind` on a fresh connection.
    async fn open(&self, kind: TestKind, reporter: &EventReporter) -> Result<BufReader<TcpStream>> {
        let stream = self
            .bounded("connect", TcpStream::connect(&self.target))
            .await?
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", self.target, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {} for {} test", self.target, kind);

        let mut stream = BufReader::new(stream);
        let banner = self
            .bounded(
                "handshake",
                protocol::client_handshake(&mut stream, self.config.protocol_version),
            )
            .await??;

        let text = banner.display_text();
        if self.measurements.set_banner_once(text.clone()) && !text.is_empty() {
            reporter.emit(ProgressEvent::Banner(text));
        }

        protocol::send_command(stream.get_mut(), kind).await?;
        Ok(stream)
    }

    /// Runs a setup step under the connect timeout, giving up on cancellation.
    async fn bounded<F, T>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                Err(Error::Test(format!("run cancelled during {}", step)))
            }
            res = time::timeout(self.config.connect_timeout, fut) => res.map_err(|_| {
                Error::Timeout(format!(
                    "{} with {} did not finish within {:?}",
                    step, self.target, self.config.connect_timeout
                ))
            }),
        }
    }

    /// Returns the measurements of the last run.
    pub fn get_measurements(&self) -> crate::Measurements {
        self.measurements.get()
    }
}
