//! Newline-delimited JSON framing for serial links and text frames.
//!
//! Serial wire format: one JSON object per line, `\n` terminated.
//! Websocket text frames carry exactly one JSON object each.
//!
//! Parsing never panics and never propagates: every function returns a
//! `FrameError` the caller logs and discards.

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ClientMessage, DeviceMessage, HubMessage};

/// Lines longer than this are discarded as line noise.
pub const MAX_LINE_BYTES: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("not JSON: {0}")]
    NotJson(String),

    #[error("frame has no string 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' frame: {reason}")]
    Invalid { kind: String, reason: String },

    #[error("frame exceeds {MAX_LINE_BYTES} bytes")]
    TooLong,
}

impl FrameError {
    /// True for frames whose type is simply not one we handle.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, FrameError::UnknownType(_))
    }
}

/// Write one JSON object followed by `\n` and flush.
pub fn write_line<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let mut payload =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    writer.write_all(&payload)?;
    writer.flush()
}

/// Encode a message as a single text frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<String, FrameError> {
    serde_json::to_string(msg).map_err(|e| FrameError::Invalid {
        kind: "outbound".into(),
        reason: e.to_string(),
    })
}

pub fn parse_device_line(line: &str) -> Result<DeviceMessage, FrameError> {
    classify(line, &DeviceMessage::TYPES)
}

pub fn parse_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    classify(text, &ClientMessage::TYPES)
}

pub fn parse_hub_frame(text: &str) -> Result<HubMessage, FrameError> {
    classify(text, &HubMessage::TYPES)
}

/// Split parsing into "is this JSON", "is this a type we know" and "is it
/// well formed" so callers can count each failure separately.
fn classify<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, FrameError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(FrameError::Empty);
    }
    if text.len() > MAX_LINE_BYTES {
        return Err(FrameError::TooLong);
    }
    // Controllers print boot banners before their JSON stream starts.
    if !text.starts_with('{') {
        return Err(FrameError::NotJson(truncate(text)));
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::NotJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if !known.contains(&kind.as_str()) {
        return Err(FrameError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| FrameError::Invalid {
        kind,
        reason: e.to_string(),
    })
}

fn truncate(text: &str) -> String {
    text.chars().take(48).collect()
}

/// Accumulates bytes from a timeout-driven reader and yields complete lines.
///
/// Serial ports report "no data yet" as `TimedOut`; that is surfaced as
/// `Ok(None)` so callers can interleave other work. End of stream is an
/// `UnexpectedEof` error.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
    discarding: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            discarding: false,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Return the next complete line, or `None` if the reader timed out first.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }

            let mut buf = [0u8; 256];
            match self.inner.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial stream closed",
                    ))
                }
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if self.discarding {
                // Tail of an over-long line.
                self.discarding = false;
                continue;
            }
            if raw.len() > MAX_LINE_BYTES {
                continue;
            }
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            return Some(line);
        }
        if self.pending.len() > MAX_LINE_BYTES {
            self.pending.clear();
            self.discarding = true;
        }
        None
    }
}
