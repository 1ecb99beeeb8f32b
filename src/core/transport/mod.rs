//! Logical-channel transport
//! Frames variable-length messages over the L2CAP byte streams.

pub mod framer;
pub mod pipe;
pub mod session;
mod types;

pub use framer::{HEADER_LEN, InboundAssembly, OutboundAssembly, SendCompletion, encode_frame};
pub use pipe::{InboundFeeder, InboundPipe, OutboundDrain, OutboundPipe, inbound_pipe, outbound_pipe};
pub use session::{ChannelSession, FrameSubmitter, SessionOutcome};
pub use types::{
    ByteSink, ByteSource, ChannelId, ChannelStreams, SendError, StreamDirection, StreamEvent, StreamEventKind,
    TransportError,
};
