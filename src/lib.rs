//! speedfish - a lightweight TCP speed test
//!
//! A standalone server and a client that measure round-trip latency and
//! download/upload throughput over plain TCP, using a small line-oriented
//! handshake protocol.
//!
//! # Features
//!
//! - Single-byte echo latency test with min/max/mean/standard deviation
//! - Fixed-duration download and upload tests sampled at a fixed interval
//! - One isolated task per server connection, no shared mutable state
//! - Typed progress events for whatever presentation layer sits on top
//! - JSON output of the final measurements

pub mod client;
pub mod config;
pub mod copier;
pub mod error;
pub mod latency;
pub mod measurements;
pub mod payload;
pub mod protocol;
pub mod reporter;
pub mod sampler;
pub mod server;

pub use client::Client;
pub use config::{Config, Mode};
pub use error::{Error, Result};
pub use measurements::Measurements;
pub use protocol::TestKind;
pub use reporter::{ProgressCallback, ProgressEvent};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
