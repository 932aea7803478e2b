//! Throughput sampler: turns block ticks into periodic rate samples.
//!
//! The sampler runs as its own task next to a
//! [`MeteredCopier`](crate::copier::MeteredCopier). It counts ticks as they
//! arrive and, on every reporting interval, converts the count delta into
//! bits per second. An interval without ticks produces a sample of 0.

use crate::protocol::TestKind;
use crate::reporter::{EventReporter, ProgressEvent};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One periodic throughput measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// Test the sample belongs to
    pub kind: TestKind,
    /// Zero-based position in the sample sequence
    pub index: u64,
    /// Time since sampling started, at the end of the interval
    pub elapsed: Duration,
    /// Blocks completed during the interval
    pub blocks: u64,
    pub bits_per_second: f64,
}

/// Running aggregate over all samples of a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub count: u64,
}

impl ThroughputStats {
    pub fn record(&mut self, bits_per_second: f64) {
        if self.count == 0 {
            self.min = bits_per_second;
            self.max = bits_per_second;
        } else {
            self.min = self.min.min(bits_per_second);
            self.max = self.max.max(bits_per_second);
        }
        self.average =
            (self.average * self.count as f64 + bits_per_second) / (self.count + 1) as f64;
        self.current = bits_per_second;
        self.count += 1;
    }
}

/// Most recent samples, oldest first, bounded to a fixed capacity.
///
/// ```
/// use speedfish::sampler::ThroughputHistory;
///
/// let mut history = ThroughputHistory::new(2);
/// history.push(1.0);
/// history.push(2.0);
/// history.push(3.0);
/// assert_eq!(history.to_vec(), vec![2.0, 3.0]);
/// ```
#[derive(Debug, Clone)]
pub struct ThroughputHistory {
    cap: usize,
    samples: VecDeque<f64>,
}

impl ThroughputHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            samples: VecDeque::with_capacity(cap),
        }
    }

    pub fn push(&mut self, bits_per_second: f64) {
        if self.cap == 0 {
            return;
        }
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(bits_per_second);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

/// Rate of `blocks` blocks of `block_size` bytes over `interval`, in bit/s.
///
/// ```
/// use speedfish::sampler::interval_rate;
/// use std::time::Duration;
///
/// // 10 blocks of 1000 bytes in half a second
/// assert_eq!(interval_rate(10, 1000, Duration::from_millis(500)), 160_000.0);
/// assert_eq!(interval_rate(0, 1000, Duration::from_millis(500)), 0.0);
/// ```
pub fn interval_rate(blocks: u64, block_size: usize, interval: Duration) -> f64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (blocks as f64 * block_size as f64 * 8.0) / secs
}

/// What a sampler saw over a whole test.
#[derive(Debug, Clone)]
pub struct SamplerReport {
    pub kind: TestKind,
    /// Every tick received before completion
    pub total_blocks: u64,
    /// Every sample, in order
    pub samples: Vec<f64>,
    /// Bounded display history
    pub history: ThroughputHistory,
    pub stats: ThroughputStats,
}

/// Periodically converts tick counts into [`ThroughputSample`]s.
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    kind: TestKind,
    block_size: usize,
    interval: Duration,
    history_cap: usize,
    expected: Duration,
    start: Option<Instant>,
    label: String,
}

/// Running totals while a sampler is active.
struct Tally {
    count: u64,
    previous: u64,
    history: ThroughputHistory,
    samples: Vec<f64>,
    stats: ThroughputStats,
}

impl ThroughputSampler {
    pub fn new(kind: TestKind, block_size: usize, interval: Duration) -> Self {
        Self {
            kind,
            block_size,
            interval,
            history_cap: 70,
            expected: Duration::ZERO,
            start: None,
            label: String::new(),
        }
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Nominal test length, used to derive progress fractions.
    pub fn with_expected_duration(mut self, expected: Duration) -> Self {
        self.expected = expected;
        self
    }

    /// Anchors the sampling grid to `start`, normally the instant the
    /// paired copier measures its deadline from. Defaults to the first poll.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Samples until `done` is cancelled.
    ///
    /// Ticks already queued when completion is observed still count. They
    /// go into one last sample if more than half an interval has passed
    /// since the previous one, so a copy ending on the sampling grid yields
    /// exactly `duration / interval` samples.
    pub async fn run(
        self,
        mut ticks: mpsc::Receiver<()>,
        done: CancellationToken,
        reporter: EventReporter,
    ) -> SamplerReport {
        let start = self.start.unwrap_or_else(Instant::now);
        let mut ticker = time::interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tally = Tally {
            count: 0,
            previous: 0,
            history: ThroughputHistory::new(self.history_cap),
            samples: Vec::new(),
            stats: ThroughputStats::default(),
        };
        let mut last_sample_at = start;
        let mut ticks_open = true;

        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => break,
                tick = ticks.recv(), if ticks_open => match tick {
                    Some(()) => tally.count += 1,
                    None => ticks_open = false,
                },
                scheduled = ticker.tick() => {
                    last_sample_at = scheduled;
                    self.publish(&mut tally, scheduled.duration_since(start), &reporter);
                }
            }
        }

        while let Ok(()) = ticks.try_recv() {
            tally.count += 1;
        }

        let now = Instant::now();
        if now.saturating_duration_since(last_sample_at) > self.interval / 2 {
            self.publish(&mut tally, now.duration_since(start), &reporter);
        }

        SamplerReport {
            kind: self.kind,
            total_blocks: tally.count,
            samples: tally.samples,
            history: tally.history,
            stats: tally.stats,
        }
    }

    fn publish(&self, tally: &mut Tally, elapsed: Duration, reporter: &EventReporter) {
        let delta = tally.count - tally.previous;
        tally.previous = tally.count;
        let rate = interval_rate(delta, self.block_size, self.interval);

        tally.history.push(rate);
        tally.samples.push(rate);
        tally.stats.record(rate);
        debug!(
            "[{}] {} {:.2}s: {:.2} Mbit/s",
            self.label,
            self.kind,
            elapsed.as_secs_f64(),
            rate / 1_000_000.0
        );

        let sample = ThroughputSample {
            kind: self.kind,
            index: tally.samples.len() as u64 - 1,
            elapsed,
            blocks: delta,
            bits_per_second: rate,
        };
        reporter.emit(ProgressEvent::Throughput {
            sample,
            stats: tally.stats,
        });
        reporter.emit(ProgressEvent::TestProgress {
            kind: self.kind,
            fraction: self.progress(elapsed),
        });
    }

    fn progress(&self, elapsed: Duration) -> f64 {
        if self.expected.is_zero() {
            return 0.0;
        }
        (elapsed.as_secs_f64() / self.expected.as_secs_f64()).min(1.0)
    }
}
