//! Length-prefixed framing for the logical channel
//! Every frame is `[u32 little-endian length][payload]`, identical in both directions.

use log::{debug, error};

use super::types::{ByteSink, ByteSource, SendError, TransportError};

/// Size of the length header in bytes
pub const HEADER_LEN: usize = 4;

/// Invoked exactly once when an outbound frame finishes, successfully or not.
pub type SendCompletion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Prepends the length header to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, SendError> {
    let len = u32::try_from(payload.len()).map_err(|_| SendError::PayloadTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn decode_header(header: [u8; HEADER_LEN]) -> u32 {
    u32::from_le_bytes(header)
}

/// Number of full-size writes needed to push a frame carrying `payload_len` bytes
/// through a stream accepting `mtu` bytes per write.
pub fn write_count(payload_len: usize, mtu: usize) -> usize {
    (payload_len + HEADER_LEN).div_ceil(mtu.max(1))
}

/// Receive-side state for the frame currently being reassembled.
#[derive(Debug)]
pub struct InboundAssembly {
    expected_length: Option<u32>,
    buffer: Vec<u8>,
    max_frame_len: u32,
}

impl InboundAssembly {
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            expected_length: None,
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Length announced by the current frame's header, if one has been read.
    pub fn expected_length(&self) -> Option<u32> {
        self.expected_length
    }

    /// Payload bytes collected so far for the current frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.expected_length = None;
        self.buffer.clear();
    }

    /// Consumes everything `source` currently holds and returns the frames it completed.
    ///
    /// A header is only read once all 4 bytes are buffered; otherwise the bytes stay in
    /// the stream until the next readable notification. Payload reads are capped at
    /// `mtu` and never run past the current frame's boundary.
    pub fn drain(
        &mut self,
        source: &mut dyn ByteSource,
        mtu: usize,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let mtu = mtu.max(1);
        let mut frames = Vec::new();
        let mut chunk = vec![0u8; mtu];

        loop {
            let expected = match self.expected_length {
                Some(len) => len as usize,
                None => {
                    if source.available() < HEADER_LEN {
                        break;
                    }
                    let len = self.read_header(source)?;
                    len as usize
                }
            };

            let remaining = expected - self.buffer.len();
            if remaining > 0 {
                let wanted = remaining.min(mtu);
                let read = source.read(&mut chunk[..wanted])?;
                if read == 0 {
                    break;
                }
                self.buffer.extend_from_slice(&chunk[..read]);
                debug!(
                    "Received {} bytes from stream. Total received: {}/{}",
                    read,
                    self.buffer.len(),
                    expected
                );
            }

            if self.buffer.len() >= expected {
                let mut frame = std::mem::take(&mut self.buffer);
                frame.truncate(expected);
                self.expected_length = None;
                frames.push(frame);
            }
        }

        Ok(frames)
    }

    fn read_header(&mut self, source: &mut dyn ByteSource) -> Result<u32, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        let read = source.read(&mut header)?;
        if read != HEADER_LEN {
            self.reset();
            return Err(TransportError::ShortHeader(read));
        }

        let len = decode_header(header);
        if len > self.max_frame_len {
            self.reset();
            return Err(TransportError::FrameTooLarge {
                len,
                limit: self.max_frame_len,
            });
        }

        debug!("Successfully read frame size: {} bytes", len);
        self.expected_length = Some(len);
        self.buffer.clear();
        self.buffer.reserve(len as usize);
        Ok(len)
    }
}

/// Send-side state for the single frame in flight.
pub struct OutboundAssembly {
    frame: Vec<u8>,
    send_offset: usize,
    completion: Option<SendCompletion>,
}

impl OutboundAssembly {
    pub fn new(payload: &[u8], completion: SendCompletion) -> Result<Self, SendError> {
        let frame = encode_frame(payload)?;
        Ok(Self {
            frame,
            send_offset: 0,
            completion: Some(completion),
        })
    }

    pub fn send_offset(&self) -> usize {
        self.send_offset
    }

    pub fn total_len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_complete(&self) -> bool {
        self.send_offset == self.frame.len()
    }

    /// Writes MTU-sized chunks while the sink keeps accepting them in full.
    ///
    /// A short write clears `writable`; the caller sets it again on the next
    /// `HasSpaceAvailable`. Returns whether the whole frame has been written.
    pub fn pump(
        &mut self,
        sink: &mut dyn ByteSink,
        mtu: usize,
        writable: &mut bool,
    ) -> Result<bool, TransportError> {
        let mtu = mtu.max(1);
        while *writable && self.send_offset < self.frame.len() {
            let end = (self.send_offset + mtu).min(self.frame.len());
            let wanted = end - self.send_offset;
            let written = sink
                .write(&self.frame[self.send_offset..end])
                .map_err(TransportError::Write)?
                .min(wanted);

            self.send_offset += written;
            debug!(
                "Sent {} bytes. Total sent: {}/{}",
                written,
                self.send_offset,
                self.frame.len()
            );
            if written < wanted {
                *writable = false;
            }
        }
        Ok(self.is_complete())
    }

    /// Hands the result to the completion callback and drops the frame.
    pub fn finish(mut self, result: Result<(), TransportError>) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl Drop for OutboundAssembly {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            error!(
                "Outbound frame dropped at {}/{} bytes",
                self.send_offset,
                self.frame.len()
            );
            completion(Err(TransportError::SessionClosed));
        }
    }
}
