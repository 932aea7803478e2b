//! Wire codec for the speedfish handshake and test selection.
//!
//! Every connection opens with a line-oriented exchange:
//!
//! 1. Client sends `HELO<v>\n`, `v` being a single decimal digit
//! 2. Server answers `HELO\n<cname|none>\n<location|none>\n`
//! 3. Client sends one of `SND\n`, `RCV\n` or `ECO\n`
//!
//! Validation failures are answered with a single `ERR:<reason>\n` line,
//! after which the server closes the connection. All client frames are
//! newline terminated; the server trims surrounding whitespace so `\r\n`
//! line endings are accepted as well.

use crate::config::MAX_BANNER_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u8 = 0;

/// Upper bound on the length of any single handshake or command frame.
pub const MAX_FRAME_LEN: u64 = 64;

const HELO: &str = "HELO";
const NONE: &str = "none";

/// The kind of test selected for a connection.
///
/// Exactly one kind is served per connection and it never changes once
/// negotiated. Directions are named from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestKind {
    /// Server streams payload to the client (`SND`)
    Download,
    /// Client streams payload to the server (`RCV`)
    Upload,
    /// Single-byte round trips (`ECO`)
    Echo,
}

impl TestKind {
    /// The 3-byte command a client sends to request this test.
    pub fn command(self) -> &'static str {
        match self {
            TestKind::Download => "SND",
            TestKind::Upload => "RCV",
            TestKind::Echo => "ECO",
        }
    }

    /// Maps a received command back to a test kind.
    pub fn from_command(cmd: &[u8]) -> Option<Self> {
        match cmd {
            b"SND" => Some(TestKind::Download),
            b"RCV" => Some(TestKind::Upload),
            b"ECO" => Some(TestKind::Echo),
            _ => None,
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestKind::Download => "download",
            TestKind::Upload => "upload",
            TestKind::Echo => "echo",
        };
        f.write_str(name)
    }
}

/// A request the server refuses to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Handshake frame of the wrong length or prefix, or a non-digit version
    InvalidHelo,
    /// Requested version is newer than the server speaks
    UnsupportedVersion(u8),
    /// Command frame that is not one of `SND`, `RCV`, `ECO`
    InvalidCommand,
}

impl ProtocolViolation {
    /// Human readable reason carried in the `ERR:` line.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolViolation::InvalidHelo => "Invalid HELO received",
            ProtocolViolation::UnsupportedVersion(_) => "Protocol version not supported",
            ProtocolViolation::InvalidCommand => "Invalid command received",
        }
    }

    /// The full error frame written to the peer.
    pub fn error_line(&self) -> Vec<u8> {
        encode_error(self.reason())
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::UnsupportedVersion(v) => write!(f, "{} ({})", self.reason(), v),
            _ => f.write_str(self.reason()),
        }
    }
}

/// Server identification sent after a successful handshake.
///
/// Both fields are sanitized to printable ASCII and capped at
/// [`MAX_BANNER_LEN`] characters on construction, so whatever the operator
/// configures can never break the line framing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBanner {
    pub cname: Option<String>,
    pub location: Option<String>,
}

impl ServerBanner {
    pub fn new(cname: Option<&str>, location: Option<&str>) -> Self {
        Self {
            cname: cname.and_then(clean_field),
            location: location.and_then(clean_field),
        }
    }

    /// Encodes the three-line handshake response.
    ///
    /// ```
    /// use speedfish::protocol::ServerBanner;
    ///
    /// let banner = ServerBanner::new(None, None);
    /// assert_eq!(banner.encode(), b"HELO\nnone\nnone\n");
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n",
            HELO,
            self.cname.as_deref().unwrap_or(NONE),
            self.location.as_deref().unwrap_or(NONE)
        )
        .into_bytes()
    }

    /// Text shown to the user: `cname :: location`, bounded to
    /// [`MAX_BANNER_LEN`] characters. Empty when the server reported neither.
    ///
    /// ```
    /// use speedfish::protocol::ServerBanner;
    ///
    /// let banner = ServerBanner::new(Some("speed.example.net"), Some("Dallas, TX"));
    /// assert_eq!(banner.display_text(), "speed.example.net :: Dallas, TX");
    /// assert_eq!(ServerBanner::default().display_text(), "");
    /// ```
    pub fn display_text(&self) -> String {
        let mut text = String::new();
        if let Some(cname) = &self.cname {
            text.push_str(&sanitize(cname));
        }
        if let Some(location) = &self.location {
            if !text.is_empty() {
                text.push_str(" :: ");
            }
            text.push_str(&sanitize(location));
        }
        truncate(&mut text, MAX_BANNER_LEN);
        text
    }
}

fn clean_field(raw: &str) -> Option<String> {
    let mut field = sanitize(raw.trim());
    truncate(&mut field, MAX_BANNER_LEN);
    if field.is_empty() || field == NONE {
        None
    } else {
        Some(field)
    }
}

fn truncate(text: &mut String, max: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
}

/// Strips everything outside printable ASCII (codepoints 32 to 126).
///
/// ```
/// use speedfish::protocol::sanitize;
///
/// assert_eq!(sanitize("Dal\x07las\n"), "Dallas");
/// assert_eq!(sanitize("Zürich"), "Zrich");
/// ```
pub fn sanitize(text: &str) -> String {
    text.chars().filter(|c| (' '..='~').contains(c)).collect()
}

/// Encodes the client handshake request, e.g. `HELO0\n`.
pub fn encode_hello(version: u8) -> Vec<u8> {
    format!("{}{}\n", HELO, version).into_bytes()
}

/// Encodes a test-selection command, e.g. `SND\n`.
pub fn encode_command(kind: TestKind) -> Vec<u8> {
    format!("{}\n", kind.command()).into_bytes()
}

/// Encodes an `ERR:<reason>\n` line.
pub fn encode_error(reason: &str) -> Vec<u8> {
    format!("ERR:{}\n", reason).into_bytes()
}

/// Validates a trimmed handshake frame against the highest version the
/// server supports and returns the requested version.
///
/// ```
/// use speedfish::protocol::{parse_hello, ProtocolViolation};
///
/// assert_eq!(parse_hello(b"HELO0", 0), Ok(0));
/// assert_eq!(parse_hello(b"HELO3", 0), Err(ProtocolViolation::UnsupportedVersion(3)));
/// assert_eq!(parse_hello(b"HELLO", 0), Err(ProtocolViolation::InvalidHelo));
/// ```
pub fn parse_hello(frame: &[u8], supported: u8) -> std::result::Result<u8, ProtocolViolation> {
    if frame.len() != HELO.len() + 1 || !frame.starts_with(HELO.as_bytes()) {
        return Err(ProtocolViolation::InvalidHelo);
    }
    let digit = frame[HELO.len()];
    if !digit.is_ascii_digit() {
        return Err(ProtocolViolation::InvalidHelo);
    }
    let version = digit - b'0';
    if version > supported {
        return Err(ProtocolViolation::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Validates a trimmed command frame.
pub fn parse_command(frame: &[u8]) -> std::result::Result<TestKind, ProtocolViolation> {
    if frame.len() != 3 {
        return Err(ProtocolViolation::InvalidCommand);
    }
    TestKind::from_command(frame).ok_or(ProtocolViolation::InvalidCommand)
}

/// Reads one newline-terminated frame, bounded to [`MAX_FRAME_LEN`] bytes,
/// with surrounding whitespace removed.
///
/// Returns `Ok(None)` if the peer closed the connection before sending
/// anything.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let mut limited = (&mut *reader).take(MAX_FRAME_LEN);
    let n = limited.read_until(b'\n', &mut frame).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(frame.trim_ascii().to_vec()))
}

/// Client side of the handshake: sends `HELO<version>` and reads the banner.
///
/// An `ERR:` answer is surfaced as [`Error::Rejected`].
pub async fn client_handshake<S>(stream: &mut S, version: u8) -> Result<ServerBanner>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_hello(version)).await?;
    stream.flush().await?;

    let first = expect_line(stream).await?;
    if let Some(reason) = first.strip_prefix("ERR:") {
        return Err(Error::Rejected(reason.to_string()));
    }
    if first != HELO {
        return Err(Error::Protocol(format!(
            "invalid HELO response from server: {:?}",
            first
        )));
    }

    let cname = expect_line(stream).await?;
    let location = expect_line(stream).await?;
    Ok(ServerBanner::new(Some(&cname), Some(&location)))
}

/// Sends a test-selection command.
pub async fn send_command<W>(writer: &mut W, kind: TestKind) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_command(kind)).await?;
    writer.flush().await?;
    Ok(())
}

async fn expect_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(String::from_utf8_lossy(&frame).into_owned()),
        None => Err(Error::Connection(
            "server closed the connection during handshake".to_string(),
        )),
    }
}
