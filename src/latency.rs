//! Latency prober: single-byte echo round trips.
//!
//! The client side ([`LatencyProber`]) times each round trip and hands the
//! durations to a separate aggregator task, which recomputes the statistics
//! from the full history after every sample. The server side
//! ([`echo_responder`]) just reflects bytes.

use crate::protocol::TestKind;
use crate::reporter::{EventReporter, ProgressEvent};
use crate::{Error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Byte sent in every probe (`.`).
pub const PROBE_BYTE: u8 = b'.';

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Zero-based round number
    pub round: usize,
    pub micros: u64,
}

/// Statistics over every sample collected so far, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    /// Population standard deviation
    pub stddev_us: f64,
}

impl LatencyStats {
    /// Computes the statistics from scratch; `None` for an empty history.
    ///
    /// ```
    /// use speedfish::latency::LatencyStats;
    ///
    /// let stats = LatencyStats::from_samples(&[2, 4, 4, 4, 5, 5, 7, 9]).unwrap();
    /// assert_eq!(stats.mean_us, 5.0);
    /// assert_eq!(stats.stddev_us, 2.0);
    /// assert!(LatencyStats::from_samples(&[]).is_none());
    /// ```
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let count = samples.len();
        let mean = samples.iter().map(|s| *s as f64).sum::<f64>() / count as f64;
        let variance = samples
            .iter()
            .map(|s| {
                let d = *s as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;

        Some(Self {
            count,
            min_us: sorted[0],
            max_us: sorted[count - 1],
            mean_us: mean,
            stddev_us: variance.sqrt(),
        })
    }
}

/// Result of a latency test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyReport {
    /// Round-trip times in microseconds, in order
    pub samples_us: Vec<u64>,
    pub stats: Option<LatencyStats>,
    /// Set when the probing ceiling cut the test short
    pub truncated: bool,
}

/// Client side of the echo test.
#[derive(Debug, Clone)]
pub struct LatencyProber {
    rounds: usize,
    ceiling: Duration,
    debug: bool,
}

impl LatencyProber {
    pub fn new(rounds: usize, ceiling: Duration) -> Self {
        Self {
            rounds,
            ceiling,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Runs up to `rounds` round trips over `stream`.
    ///
    /// Hitting the ceiling stops probing early and is not an error; any
    /// I/O failure or a byte that comes back altered is.
    pub async fn probe<S>(
        &self,
        stream: &mut S,
        abort: &CancellationToken,
        reporter: EventReporter,
    ) -> Result<LatencyReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = mpsc::channel(self.rounds.max(1));
        let aggregator = tokio::spawn(aggregate(rx, self.rounds, reporter));

        let deadline = Instant::now() + self.ceiling;
        let mut truncated = false;
        let mut echo = [0u8; 1];

        for round in 0..self.rounds {
            let round_trip = async {
                let started = Instant::now();
                stream.write_all(&[PROBE_BYTE]).await?;
                stream.flush().await?;
                stream.read_exact(&mut echo).await?;
                Ok::<Duration, io::Error>(started.elapsed())
            };
            let outcome = tokio::select! {
                _ = abort.cancelled() => {
                    return Err(Error::Test("latency test cancelled".to_string()));
                }
                res = time::timeout_at(deadline, round_trip) => res,
            };

            match outcome {
                Err(_) => {
                    info!(
                        "Latency probing stopped at the {:?} ceiling after {} rounds",
                        self.ceiling, round
                    );
                    truncated = true;
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(rtt)) => {
                    if echo[0] != PROBE_BYTE {
                        return Err(Error::Protocol(format!(
                            "echo returned {:#04x}, expected {:#04x}",
                            echo[0], PROBE_BYTE
                        )));
                    }
                    if self.debug {
                        debug!("Echo round {} took {:?}", round + 1, rtt);
                    }
                    let _ = tx.send(rtt).await;
                }
            }
        }
        drop(tx);

        let (samples_us, stats) = aggregator
            .await
            .map_err(|e| Error::Test(format!("latency aggregator failed: {}", e)))?;
        Ok(LatencyReport {
            samples_us,
            stats,
            truncated,
        })
    }
}

/// Collects round-trip times and publishes recomputed statistics after each.
async fn aggregate(
    mut rx: mpsc::Receiver<Duration>,
    rounds: usize,
    reporter: EventReporter,
) -> (Vec<u64>, Option<LatencyStats>) {
    let mut history: Vec<u64> = Vec::with_capacity(rounds);

    while let Some(rtt) = rx.recv().await {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
        history.push(micros);

        if let Some(stats) = LatencyStats::from_samples(&history) {
            let sample = LatencySample {
                round: history.len() - 1,
                micros,
            };
            reporter.emit(ProgressEvent::Latency { sample, stats });
        }
        reporter.emit(ProgressEvent::TestProgress {
            kind: TestKind::Echo,
            fraction: (history.len() as f64 / rounds.max(1) as f64).min(1.0),
        });
    }

    let stats = LatencyStats::from_samples(&history);
    (history, stats)
}

/// Server side of the echo test: reflects up to `rounds` single bytes.
///
/// Read or write failures end the exchange early; the number of bytes
/// echoed is returned.
pub async fn echo_responder<S>(stream: &mut S, rounds: usize, debug: bool, peer: &str) -> usize
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut byte = [0u8; 1];
    let mut echoed = 0;

    while echoed < rounds {
        if let Err(e) = stream.read_exact(&mut byte).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                debug!("[{}] Client closed echo test after {} rounds", peer, echoed);
            } else {
                warn!("[{}] Error reading echo byte: {}", peer, e);
            }
            break;
        }
        if debug {
            debug!("[{}] Copying byte: {}", peer, byte[0]);
        }
        if let Err(e) = stream.write_all(&byte).await {
            warn!("[{}] Error writing echo byte: {}", peer, e);
            break;
        }
        if let Err(e) = stream.flush().await {
            warn!("[{}] Error flushing echo byte: {}", peer, e);
            break;
        }
        echoed += 1;
    }
    echoed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_samples_have_zero_deviation() {
        let stats = LatencyStats::from_samples(&[750; 30]).unwrap();
        assert_eq!(stats.min_us, 750);
        assert_eq!(stats.max_us, 750);
        assert_eq!(stats.mean_us, 750.0);
        assert_eq!(stats.stddev_us, 0.0);
    }

    #[test]
    fn test_min_max_ignore_order() {
        let stats = LatencyStats::from_samples(&[40, 10, 30, 20]).unwrap();
        assert_eq!(stats.min_us, 10);
        assert_eq!(stats.max_us, 40);
        assert_eq!(stats.mean_us, 25.0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: min <= mean <= max and the deviation is never negative
            #[test]
            fn prop_stats_ordered(samples in proptest::collection::vec(0u64..10_000_000, 1..64)) {
                let stats = LatencyStats::from_samples(&samples).unwrap();
                prop_assert_eq!(stats.count, samples.len());
                prop_assert!(stats.min_us as f64 <= stats.mean_us + 1e-6);
                prop_assert!(stats.mean_us <= stats.max_us as f64 + 1e-6);
                prop_assert!(stats.stddev_us >= 0.0);
            }
        }
    }

    #[tokio::test]
    async fn test_thirty_rounds_over_responder() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let responder =
            tokio::spawn(async move { echo_responder(&mut server, 30, true, "test").await });

        let (reporter, mut events) = EventReporter::new(128);
        let prober = LatencyProber::new(30, Duration::from_secs(10));
        let report = prober
            .probe(&mut client, &CancellationToken::new(), reporter)
            .await
            .unwrap();

        assert_eq!(responder.await.unwrap(), 30);
        assert_eq!(report.samples_us.len(), 30);
        assert!(!report.truncated);
        let stats = report.stats.unwrap();
        assert!(stats.min_us as f64 <= stats.mean_us);
        assert!(stats.mean_us <= stats.max_us as f64);

        let mut latency_events = 0;
        let mut last_fraction = 0.0;
        while let Ok(event) = events.try_recv() {
            match event {
                ProgressEvent::Latency { sample, .. } => {
                    assert_eq!(sample.round, latency_events);
                    latency_events += 1;
                }
                ProgressEvent::TestProgress { fraction, .. } => last_fraction = fraction,
                _ => {}
            }
        }
        assert_eq!(latency_events, 30);
        assert_eq!(last_fraction, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_is_a_soft_cap() {
        // Peer reads probes but never answers
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut sink = [0u8; 64];
            while let Ok(n) = server.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });

        let prober = LatencyProber::new(30, Duration::from_secs(10));
        let report = prober
            .probe(&mut client, &CancellationToken::new(), EventReporter::disabled())
            .await
            .unwrap();

        assert!(report.truncated);
        assert!(report.samples_us.is_empty());
        assert!(report.stats.is_none());
    }

    #[tokio::test]
    async fn test_altered_echo_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            server.read_exact(&mut byte).await.unwrap();
            server.write_all(b"x").await.unwrap();
        });

        let prober = LatencyProber::new(3, Duration::from_secs(10));
        let result = prober
            .probe(&mut client, &CancellationToken::new(), EventReporter::disabled())
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_responder_stops_on_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"...").await.unwrap();
        drop(client);

        let echoed = echo_responder(&mut server, 30, false, "test").await;
        assert_eq!(echoed, 3);
    }

    #[tokio::test]
    async fn test_responder_echoes_unchanged() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let responder =
            tokio::spawn(async move { echo_responder(&mut server, 4, false, "test").await });

        for byte in [0u8, 46, 127, 255] {
            client.write_all(&[byte]).await.unwrap();
            let mut back = [0u8; 1];
            client.read_exact(&mut back).await.unwrap();
            assert_eq!(back[0], byte);
        }
        assert_eq!(responder.await.unwrap(), 4);
    }
}
