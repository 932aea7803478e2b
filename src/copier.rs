//! Metered copier: moves payload across a connection in fixed-size blocks
//! and emits one tick per completed block.
//!
//! The copier is the single producer of ticks for a transfer and the single
//! owner of its completion token. It never touches the display; a
//! [`ThroughputSampler`](crate::sampler::ThroughputSampler) turns ticks into
//! rates on its own schedule.

use crate::payload::PayloadSource;
use crate::protocol::TestKind;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Which way payload flows relative to the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Reading from the peer and discarding
    Inbound,
    /// Writing payload blocks to the peer
    Outbound,
}

impl Direction {
    /// Direction the server copies in for a given test.
    ///
    /// Returns `None` for [`TestKind::Echo`], which is not a bulk transfer.
    pub fn for_server(kind: TestKind) -> Option<Self> {
        match kind {
            TestKind::Download => Some(Direction::Outbound),
            TestKind::Upload => Some(Direction::Inbound),
            TestKind::Echo => None,
        }
    }

    /// Direction the client copies in for a given test.
    pub fn for_client(kind: TestKind) -> Option<Self> {
        match kind {
            TestKind::Download => Some(Direction::Inbound),
            TestKind::Upload => Some(Direction::Outbound),
            TestKind::Echo => None,
        }
    }
}

/// Why a copy stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyEnd {
    /// The time limit elapsed
    Deadline,
    /// The peer closed or reset the connection
    PeerClosed,
    /// The local side cancelled the run
    Aborted,
    /// Any other I/O error
    Failed(String),
}

/// Outcome of one metered copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyReport {
    pub direction: Direction,
    /// Whole blocks copied; partial blocks are never counted
    pub blocks: u64,
    /// `blocks * block_size`
    pub bytes: u64,
    pub elapsed: Duration,
    pub end: CopyEnd,
}

impl CopyReport {
    /// Average rate over the whole copy in bits per second.
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 * 8.0) / secs
        } else {
            0.0
        }
    }
}

/// Copies fixed-size blocks in one direction until a time limit, EOF,
/// an I/O error or cancellation.
#[derive(Debug, Clone)]
pub struct MeteredCopier {
    direction: Direction,
    block_size: usize,
    duration: Duration,
    grace: Duration,
    start: Option<Instant>,
    debug: bool,
    label: String,
}

impl MeteredCopier {
    pub fn new(direction: Direction, block_size: usize, duration: Duration) -> Self {
        Self {
            direction,
            block_size,
            duration,
            grace: Duration::ZERO,
            start: None,
            debug: false,
            label: String::new(),
        }
    }

    /// Extra time granted to inbound copies so a sender that starts late
    /// still gets its full run. Ignored for outbound copies.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Measures the time limit from `start` instead of from the first poll,
    /// so a sampler sharing the same instant ends its last interval on the
    /// deadline.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    /// Logs every copied block.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Prefix for log lines, usually the peer address.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Total time this copier allows itself.
    pub fn time_limit(&self) -> Duration {
        match self.direction {
            Direction::Inbound => self.duration + self.grace,
            Direction::Outbound => self.duration,
        }
    }

    /// Runs the copy.
    ///
    /// One tick is sent on `ticks` per completed block; the send waits when
    /// the queue is full, but never past an abort. `done` is cancelled exactly once when the copy
    /// stops, whatever the reason, and `ticks` is dropped right after.
    pub async fn run<S>(
        &self,
        stream: &mut S,
        payload: &PayloadSource,
        ticks: mpsc::Sender<()>,
        done: &CancellationToken,
        abort: &CancellationToken,
    ) -> CopyReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = self.start.unwrap_or_else(Instant::now);
        let deadline = start + self.time_limit();

        let (blocks, end) = match self.direction {
            Direction::Outbound => {
                self.send_blocks(stream, payload, &ticks, deadline, abort)
                    .await
            }
            Direction::Inbound => self.receive_blocks(stream, &ticks, deadline, abort).await,
        };

        done.cancel();
        drop(ticks);

        let report = CopyReport {
            direction: self.direction,
            blocks,
            bytes: blocks * self.block_size as u64,
            elapsed: start.elapsed(),
            end,
        };
        debug!(
            "[{}] {:?} copy finished: {} blocks in {:.2}s ({:?})",
            self.label,
            self.direction,
            report.blocks,
            report.elapsed.as_secs_f64(),
            report.end
        );
        report
    }

    async fn send_blocks<S>(
        &self,
        stream: &mut S,
        payload: &PayloadSource,
        ticks: &mpsc::Sender<()>,
        deadline: Instant,
        abort: &CancellationToken,
    ) -> (u64, CopyEnd)
    where
        S: AsyncWrite + Unpin,
    {
        let mut cursor = payload.blocks(self.block_size);
        let mut blocks = 0u64;

        let end = loop {
            if Instant::now() >= deadline {
                break CopyEnd::Deadline;
            }
            let block = cursor.next_block();
            let written = tokio::select! {
                _ = abort.cancelled() => break CopyEnd::Aborted,
                res = time::timeout_at(deadline, stream.write_all(block)) => res,
            };
            match written {
                Err(_) => break CopyEnd::Deadline,
                Ok(Ok(())) => {
                    blocks += 1;
                    if self.debug {
                        debug!("[{}] Sent block {} ({} bytes)", self.label, blocks, self.block_size);
                    }
                    tokio::select! {
                        _ = abort.cancelled() => break CopyEnd::Aborted,
                        _ = ticks.send(()) => {}
                    }
                }
                Ok(Err(e)) if is_peer_closed(&e) => break CopyEnd::PeerClosed,
                Ok(Err(e)) => {
                    error!("[{}] Error copying to client: {}", self.label, e);
                    break CopyEnd::Failed(e.to_string());
                }
            }
        };

        if !matches!(end, CopyEnd::Failed(_) | CopyEnd::PeerClosed) {
            let _ = stream.flush().await;
        }
        (blocks, end)
    }

    async fn receive_blocks<S>(
        &self,
        stream: &mut S,
        ticks: &mpsc::Sender<()>,
        deadline: Instant,
        abort: &CancellationToken,
    ) -> (u64, CopyEnd)
    where
        S: AsyncRead + Unpin,
    {
        let mut sink = vec![0u8; self.block_size];
        let mut blocks = 0u64;

        let end = loop {
            if Instant::now() >= deadline {
                break CopyEnd::Deadline;
            }
            let read = tokio::select! {
                _ = abort.cancelled() => break CopyEnd::Aborted,
                res = time::timeout_at(deadline, stream.read_exact(&mut sink)) => res,
            };
            match read {
                Err(_) => break CopyEnd::Deadline,
                Ok(Ok(_)) => {
                    blocks += 1;
                    if self.debug {
                        debug!("[{}] Received block {} ({} bytes)", self.label, blocks, self.block_size);
                    }
                    tokio::select! {
                        _ = abort.cancelled() => break CopyEnd::Aborted,
                        _ = ticks.send(()) => {}
                    }
                }
                Ok(Err(e)) if is_peer_closed(&e) => break CopyEnd::PeerClosed,
                Ok(Err(e)) => {
                    error!("[{}] Error copying from peer: {}", self.label, e);
                    break CopyEnd::Failed(e.to_string());
                }
            }
        };
        (blocks, end)
    }
}

/// EOF and the usual ways a closed socket shows up on write.
fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
