use crate::copier::{CopyEnd, CopyReport};
use crate::latency::{LatencyReport, LatencyStats};
use crate::protocol::TestKind;
use crate::sampler::{SamplerReport, ThroughputStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Where and when a run took place
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub system_info: String,
    pub timestamp: i64,
    pub timestamp_str: String,
}

/// Latency test outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResult {
    pub samples_us: Vec<u64>,
    pub stats: Option<LatencyStats>,
    /// Probing ceiling reached before all rounds completed
    pub truncated: bool,
}

impl From<LatencyReport> for LatencyResult {
    fn from(report: LatencyReport) -> Self {
        Self {
            samples_us: report.samples_us,
            stats: report.stats,
            truncated: report.truncated,
        }
    }
}

/// Download or upload test outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub kind: TestKind,
    pub blocks: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub end: CopyEnd,
    /// Every periodic sample in bit/s
    pub samples_bps: Vec<f64>,
    pub stats: ThroughputStats,
}

impl ThroughputResult {
    pub fn from_reports(kind: TestKind, copy: &CopyReport, sampled: &SamplerReport) -> Self {
        Self {
            kind,
            blocks: copy.blocks,
            bytes: copy.bytes,
            duration: copy.elapsed,
            end: copy.end.clone(),
            samples_bps: sampled.samples.clone(),
            stats: sampled.stats,
        }
    }

    /// Mean rate over the whole transfer.
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 * 8.0) / secs
        } else {
            0.0
        }
    }
}

/// Everything a client run measured
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub system: Option<SystemInfo>,
    pub server: Option<String>,
    /// Sanitized banner; empty when the server reported neither name nor location
    pub banner: Option<String>,
    pub latency: Option<LatencyResult>,
    pub download: Option<ThroughputResult>,
    pub upload: Option<ThroughputResult>,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throughput(&self, kind: TestKind) -> Option<&ThroughputResult> {
        match kind {
            TestKind::Download => self.download.as_ref(),
            TestKind::Upload => self.upload.as_ref(),
            TestKind::Echo => None,
        }
    }

    /// Multi-line plain text summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if let Some(server) = &self.server {
            out.push_str(&format!("Server:    {}\n", server));
        }
        if let Some(banner) = self.banner.as_deref().filter(|b| !b.is_empty()) {
            out.push_str(&format!("Banner:    {}\n", banner));
        }
        if let Some(stats) = self.latency.as_ref().and_then(|l| l.stats) {
            out.push_str(&format!(
                "Latency:   {:.2} ms avg, {:.2}/{:.2} ms min/max, {:.2} ms σ ({} samples)\n",
                stats.mean_us / 1000.0,
                stats.min_us as f64 / 1000.0,
                stats.max_us as f64 / 1000.0,
                stats.stddev_us / 1000.0,
                stats.count
            ));
        }
        for result in [&self.download, &self.upload].into_iter().flatten() {
            out.push_str(&format!(
                "{:<10} {:.2} Mbit/s avg, {:.2} Mbit/s peak ({:.2} MB in {:.2}s)\n",
                format!("{}:", capitalize(&result.kind.to_string())),
                result.bits_per_second() / 1_000_000.0,
                result.stats.max / 1_000_000.0,
                result.bytes as f64 / 1_000_000.0,
                result.duration.as_secs_f64()
            ));
        }
        out
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Thread-safe measurements collector
#[derive(Debug, Clone, Default)]
pub struct MeasurementsCollector {
    inner: Arc<Mutex<Measurements>>,
}

impl MeasurementsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears previous results and stamps the start of a run.
    pub fn start(&self, server: &str) {
        let mut m = self.inner.lock();
        *m = Measurements {
            system: Some(get_system_info()),
            server: Some(server.to_string()),
            ..Default::default()
        };
    }

    /// Records the banner on first call; returns whether this call set it.
    pub fn set_banner_once(&self, banner: String) -> bool {
        let mut m = self.inner.lock();
        if m.banner.is_some() {
            return false;
        }
        m.banner = Some(banner);
        true
    }

    pub fn record_latency(&self, result: LatencyResult) {
        self.inner.lock().latency = Some(result);
    }

    pub fn record_throughput(&self, result: ThroughputResult) {
        let mut m = self.inner.lock();
        match result.kind {
            TestKind::Download => m.download = Some(result),
            TestKind::Upload => m.upload = Some(result),
            TestKind::Echo => {}
        }
    }

    pub fn get(&self) -> Measurements {
        self.inner.lock().clone()
    }
}

/// Get system information
pub fn get_system_info() -> SystemInfo {
    let now = chrono::Utc::now();
    SystemInfo {
        version: format!("speedfish {}", env!("CARGO_PKG_VERSION")),
        system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        timestamp: now.timestamp(),
        timestamp_str: now.to_rfc3339(),
    }
}
