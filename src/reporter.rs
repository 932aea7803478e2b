//! Event queue between the measurement core and its presentation layer.
//!
//! The core pushes typed [`ProgressEvent`]s into a queue without ever
//! waiting; whoever owns the receiving end (a terminal renderer, a callback,
//! a test) runs its own loop over it. Nothing in the core depends on how,
//! whether, or how fast the events are displayed.

use crate::latency::{LatencySample, LatencyStats};
use crate::protocol::TestKind;
use crate::sampler::{ThroughputSample, ThroughputStats};
use log::trace;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Events emitted while a test run is in progress.
///
/// # Examples
///
/// ```
/// use speedfish::reporter::{describe, ProgressEvent};
/// use speedfish::protocol::TestKind;
///
/// let event = ProgressEvent::TestStarted(TestKind::Download);
/// assert_eq!(describe(&event).as_deref(), Some("Starting download test"));
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Sanitized server banner, sent once after the first handshake.
    ///
    /// Never emitted when the server reported neither a name nor a location.
    Banner(String),
    /// A test is starting.
    TestStarted(TestKind),
    /// Progress of the running test, from 0.0 to 1.0.
    ///
    /// A value of 0.0 directly follows every `TestStarted`.
    TestProgress { kind: TestKind, fraction: f64 },
    /// A throughput sample with the running statistics it updated.
    Throughput {
        sample: ThroughputSample,
        stats: ThroughputStats,
    },
    /// One echo round trip with the recomputed latency statistics.
    Latency {
        sample: LatencySample,
        stats: LatencyStats,
    },
    /// A test finished; always follows the last sample of that test.
    TestCompleted(TestKind),
    /// The run aborted.
    Error(String),
}

/// Callback trait for receiving progress updates during a run.
///
/// Implemented automatically for any closure with the right signature.
///
/// ```
/// use speedfish::reporter::{ProgressCallback, ProgressEvent};
///
/// struct Printer;
///
/// impl ProgressCallback for Printer {
///     fn on_progress(&self, event: ProgressEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressEvent {
    /// Whether the event may be discarded when the consumer falls behind.
    ///
    /// Samples and intermediate progress are superseded by the next one.
    /// Lifecycle markers, the banner, errors and the 0.0/1.0 progress
    /// bounds are always delivered.
    pub fn is_droppable(&self) -> bool {
        match self {
            ProgressEvent::Throughput { .. } | ProgressEvent::Latency { .. } => true,
            ProgressEvent::TestProgress { fraction, .. } => *fraction > 0.0 && *fraction < 1.0,
            _ => false,
        }
    }
}

/// Bounds how many droppable events may sit in the queue at once.
#[derive(Debug)]
struct SampleBudget {
    capacity: usize,
    queued: AtomicUsize,
    dropped: AtomicU64,
}

impl SampleBudget {
    fn acquire(&self) -> bool {
        let granted = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !granted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    fn release(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Sending half of the event queue.
///
/// Cloning is cheap; every clone feeds the same receiver. Emitting never
/// waits on the consumer: once `capacity` droppable events are queued,
/// further ones are discarded until the consumer catches up. A disabled
/// reporter silently discards everything, which is what the server uses.
#[derive(Clone, Debug)]
pub struct EventReporter {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
    budget: Arc<SampleBudget>,
}

impl EventReporter {
    /// Creates a reporter and the receiver the presentation layer polls.
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let budget = Arc::new(SampleBudget {
            capacity,
            queued: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        });
        (
            Self {
                sender: Some(sender),
                budget: budget.clone(),
            },
            EventReceiver { receiver, budget },
        )
    }

    /// A reporter with no receiver.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            budget: Arc::new(SampleBudget {
                capacity: 0,
                queued: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queues an event without waiting.
    ///
    /// A consumer that has gone away is not an error for the core.
    pub fn emit(&self, event: ProgressEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        let droppable = event.is_droppable();
        if droppable && !self.budget.acquire() {
            trace!("Event queue full, dropping {:?}", event);
            return;
        }
        if sender.send(event).is_err() && droppable {
            self.budget.release();
        }
    }

    /// Droppable events discarded so far because the consumer was behind.
    pub fn dropped(&self) -> u64 {
        self.budget.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving half of the event queue.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    budget: Arc<SampleBudget>,
}

impl EventReceiver {
    /// Next event; `None` once every reporter is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        let event = self.receiver.recv().await?;
        Some(self.settle(event))
    }

    /// Next event if one is queued right now.
    pub fn try_recv(&mut self) -> Result<ProgressEvent, TryRecvError> {
        self.receiver.try_recv().map(|event| self.settle(event))
    }

    fn settle(&self, event: ProgressEvent) -> ProgressEvent {
        if event.is_droppable() {
            self.budget.release();
        }
        event
    }
}

/// Drains the queue into a callback until every reporter is dropped.
pub async fn run_reporter_task(mut receiver: EventReceiver, callback: Arc<dyn ProgressCallback>) {
    while let Some(event) = receiver.recv().await {
        callback.on_progress(event);
    }
}

/// Formats a bit rate as Mbit/s or Gbit/s.
///
/// ```
/// use speedfish::reporter::format_rate;
///
/// assert_eq!(format_rate(93_400_000.0), "93.40 Mbit/s");
/// assert_eq!(format_rate(2_500_000_000.0), "2.50 Gbit/s");
/// ```
pub fn format_rate(bits_per_second: f64) -> String {
    if bits_per_second >= 1_000_000_000.0 {
        format!("{:.2} Gbit/s", bits_per_second / 1_000_000_000.0)
    } else {
        format!("{:.2} Mbit/s", bits_per_second / 1_000_000.0)
    }
}

/// One-line, human readable rendering of an event.
///
/// Progress events return `None`; line-oriented output has no use for them.
pub fn describe(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::Banner(text) => Some(format!("Server: {}", text)),
        ProgressEvent::TestStarted(kind) => Some(format!("Starting {} test", kind)),
        ProgressEvent::TestProgress { .. } => None,
        ProgressEvent::Throughput { sample, stats } => Some(format!(
            "[{:>8}] {:5.2} sec  {:>14}   max {:>14}   avg {:>14}",
            sample.kind.to_string(),
            sample.elapsed.as_secs_f64(),
            format_rate(sample.bits_per_second),
            format_rate(stats.max),
            format_rate(stats.average),
        )),
        ProgressEvent::Latency { sample, stats } => Some(format!(
            "[ latency] #{:<3} {:8.2} ms   min/max {:.2}/{:.2} ms   avg {:.2} ms   σ {:.2} ms",
            sample.round + 1,
            sample.micros as f64 / 1000.0,
            stats.min_us as f64 / 1000.0,
            stats.max_us as f64 / 1000.0,
            stats.mean_us / 1000.0,
            stats.stddev_us / 1000.0,
        )),
        ProgressEvent::TestCompleted(kind) => Some(format!("Finished {} test", kind)),
        ProgressEvent::Error(msg) => Some(format!("Error: {}", msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reporter_delivers_in_order() {
        let (reporter, mut receiver) = EventReporter::new(8);

        reporter.emit(ProgressEvent::TestStarted(TestKind::Echo));
        reporter.emit(ProgressEvent::TestProgress {
            kind: TestKind::Echo,
            fraction: 0.0,
        });
        reporter.emit(ProgressEvent::TestCompleted(TestKind::Echo));
        drop(reporter);

        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProgressEvent::TestStarted(TestKind::Echo)));
        assert!(matches!(events[2], ProgressEvent::TestCompleted(TestKind::Echo)));
    }

    fn throughput(index: u64) -> ProgressEvent {
        ProgressEvent::Throughput {
            sample: ThroughputSample {
                kind: TestKind::Upload,
                index,
                elapsed: Duration::from_millis(500 * (index + 1)),
                blocks: 1,
                bits_per_second: 1.0,
            },
            stats: ThroughputStats::default(),
        }
    }

    #[test]
    fn test_droppable_events() {
        assert!(throughput(0).is_droppable());
        assert!(ProgressEvent::TestProgress {
            kind: TestKind::Echo,
            fraction: 0.5
        }
        .is_droppable());
        for fraction in [0.0, 1.0] {
            assert!(!ProgressEvent::TestProgress {
                kind: TestKind::Echo,
                fraction
            }
            .is_droppable());
        }
        assert!(!ProgressEvent::TestCompleted(TestKind::Echo).is_droppable());
        assert!(!ProgressEvent::Banner("lab".to_string()).is_droppable());
        assert!(!ProgressEvent::Error("x".to_string()).is_droppable());
    }

    #[test]
    fn test_unpolled_receiver_never_blocks_emit() {
        let (reporter, mut receiver) = EventReporter::new(4);

        reporter.emit(ProgressEvent::TestStarted(TestKind::Upload));
        for i in 0..100 {
            reporter.emit(throughput(i));
        }
        reporter.emit(ProgressEvent::TestCompleted(TestKind::Upload));
        assert_eq!(reporter.dropped(), 96);

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        // Lifecycle markers survive, samples are capped
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], ProgressEvent::TestStarted(TestKind::Upload)));
        assert!(matches!(events[5], ProgressEvent::TestCompleted(TestKind::Upload)));
    }

    #[test]
    fn test_budget_freed_as_consumer_catches_up() {
        let (reporter, mut receiver) = EventReporter::new(1);

        reporter.emit(throughput(0));
        reporter.emit(throughput(1));
        assert_eq!(reporter.dropped(), 1);

        assert!(matches!(
            receiver.try_recv(),
            Ok(ProgressEvent::Throughput { sample, .. }) if sample.index == 0
        ));
        reporter.emit(throughput(2));
        assert!(matches!(
            receiver.try_recv(),
            Ok(ProgressEvent::Throughput { sample, .. }) if sample.index == 2
        ));
        assert_eq!(reporter.dropped(), 1);
    }

    #[test]
    fn test_disabled_reporter_discards() {
        let reporter = EventReporter::disabled();
        assert!(!reporter.is_enabled());
        // Must not block or panic
        reporter.emit(ProgressEvent::Banner("x".to_string()));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (reporter, receiver) = EventReporter::new(1);
        drop(receiver);
        reporter.emit(ProgressEvent::Error("gone".to_string()));
    }

    #[tokio::test]
    async fn test_reporter_task_invokes_callback() {
        let (reporter, receiver) = EventReporter::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let callback: Arc<dyn ProgressCallback> = Arc::new(move |event: ProgressEvent| {
            seen_clone.lock().unwrap().push(event);
        });

        let task = tokio::spawn(run_reporter_task(receiver, callback));
        reporter.emit(ProgressEvent::Banner("lab".to_string()));
        reporter.emit(ProgressEvent::TestStarted(TestKind::Upload));
        drop(reporter);
        task.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_describe_throughput() {
        let event = ProgressEvent::Throughput {
            sample: ThroughputSample {
                kind: TestKind::Download,
                index: 0,
                elapsed: Duration::from_millis(500),
                blocks: 10,
                bits_per_second: 50_000_000.0,
            },
            stats: ThroughputStats::default(),
        };
        let line = describe(&event).unwrap();
        assert!(line.contains("download"));
        assert!(line.contains("50.00 Mbit/s"));
    }

    #[test]
    fn test_describe_progress_is_silent() {
        let event = ProgressEvent::TestProgress {
            kind: TestKind::Upload,
            fraction: 0.5,
        };
        assert!(describe(&event).is_none());
    }
}
