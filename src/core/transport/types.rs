//! Stream abstractions and error types shared by the transport layer.

use std::fmt;
use std::io;

use thiserror::Error;

/// Inbound half of a logical channel.
///
/// Reads never block: whatever the underlying stream has buffered is returned,
/// `Ok(0)` meaning nothing is buffered right now.
pub trait ByteSource: Send {
    /// Number of bytes that can be read right now.
    fn available(&self) -> usize;

    /// Reads up to `buf.len()` buffered bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Closes the stream and releases its buffer.
    fn close(&mut self);
}

/// Outbound half of a logical channel.
pub trait ByteSink: Send {
    /// Writes as much of `buf` as the stream accepts right now.
    ///
    /// Returning less than `buf.len()` means the stream is full; a
    /// `HasSpaceAvailable` event follows once it drains.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the stream.
    fn close(&mut self);
}

/// Tells the channels opened over the lifetime of the process apart.
pub type ChannelId = u64;

/// The two byte streams of one opened logical channel.
pub struct ChannelStreams {
    pub channel: ChannelId,
    pub inbound: Box<dyn ByteSource>,
    pub outbound: Box<dyn ByteSink>,
}

impl ChannelStreams {
    pub fn new(channel: ChannelId, inbound: Box<dyn ByteSource>, outbound: Box<dyn ByteSink>) -> Self {
        Self {
            channel,
            inbound,
            outbound,
        }
    }

    /// Closes both streams.
    pub fn close(&mut self) {
        self.inbound.close();
        self.outbound.close();
    }
}

impl fmt::Debug for ChannelStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStreams")
            .field("channel", &self.channel)
            .field("inbound_available", &self.inbound.available())
            .finish_non_exhaustive()
    }
}

/// Which stream of the channel an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "Input"),
            Self::Outbound => write!(f, "Output"),
        }
    }
}

/// Edge-triggered stream notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    OpenCompleted,
    HasBytesAvailable,
    HasSpaceAvailable,
    ErrorOccurred(String),
    EndEncountered,
}

/// A stream notification, tagged with the channel that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub channel: ChannelId,
    pub direction: StreamDirection,
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn new(channel: ChannelId, direction: StreamDirection, kind: StreamEventKind) -> Self {
        Self {
            channel,
            direction,
            kind,
        }
    }
}

/// Failures of the byte streams themselves. All of them end the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream end encountered")]
    EndOfStream,

    #[error("could not read 4 bytes for length, read {0}")]
    ShortHeader(usize),

    #[error("incoming frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: u32, limit: u32 },

    #[error("stream read error: {0}")]
    Read(#[from] io::Error),

    #[error("stream write error: {0}")]
    Write(io::Error),

    #[error("channel session closed")]
    SessionClosed,
}

/// Reasons a frame submission is refused synchronously.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("a frame is already being sent")]
    InFlight,

    #[error("no open channel session")]
    NoSession,

    #[error("payload of {0} bytes does not fit a 32-bit length header")]
    PayloadTooLarge(usize),
}
