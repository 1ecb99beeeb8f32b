//! Buffered stream halves bridging an async channel to the session.
//!
//! The radio backend pumps the real L2CAP channel through these pipes so that the
//! session only ever performs non-blocking reads and writes, with readable/writable
//! edges delivered as events.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use super::types::{ByteSink, ByteSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct InboundShared {
    buffer: VecDeque<u8>,
    closed: bool,
}

/// Producer side of the inbound pipe, fed by the channel reader task.
#[derive(Clone)]
pub struct InboundFeeder {
    shared: Arc<Mutex<InboundShared>>,
}

impl InboundFeeder {
    /// Appends received bytes. Returns `false` once the session closed the pipe.
    pub fn push(&self, bytes: &[u8]) -> bool {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return false;
        }
        shared.buffer.extend(bytes);
        true
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }
}

/// Session side of the inbound pipe.
pub struct InboundPipe {
    shared: Arc<Mutex<InboundShared>>,
}

impl ByteSource for InboundPipe {
    fn available(&self) -> usize {
        lock(&self.shared).buffer.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = lock(&self.shared);
        let count = buf.len().min(shared.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(shared.buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn close(&mut self) {
        let mut shared = lock(&self.shared);
        shared.closed = true;
        shared.buffer.clear();
    }
}

pub fn inbound_pipe() -> (InboundFeeder, InboundPipe) {
    let shared = Arc::new(Mutex::new(InboundShared::default()));
    (
        InboundFeeder {
            shared: shared.clone(),
        },
        InboundPipe { shared },
    )
}

struct OutboundShared {
    buffer: VecDeque<u8>,
    capacity: usize,
    closed: bool,
    blocked: bool,
}

/// Session side of the outbound pipe. Accepts at most `capacity` unsent bytes.
pub struct OutboundPipe {
    shared: Arc<Mutex<OutboundShared>>,
    notify: Arc<Notify>,
}

impl ByteSink for OutboundPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "outbound stream closed"));
        }
        let free = shared.capacity - shared.buffer.len();
        let accepted = buf.len().min(free);
        shared.buffer.extend(&buf[..accepted]);
        if accepted < buf.len() {
            shared.blocked = true;
        }
        drop(shared);

        if accepted > 0 {
            self.notify.notify_one();
        }
        Ok(accepted)
    }

    fn close(&mut self) {
        lock(&self.shared).closed = true;
        self.notify.notify_one();
    }
}

/// Bytes taken off the outbound pipe by the writer task.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub bytes: Vec<u8>,
    /// The session hit a full pipe since the last drain and is waiting for space.
    pub space_freed: bool,
}

/// Consumer side of the outbound pipe, drained by the channel writer task.
#[derive(Clone)]
pub struct OutboundDrain {
    shared: Arc<Mutex<OutboundShared>>,
    notify: Arc<Notify>,
}

impl OutboundDrain {
    /// Takes up to `max` queued bytes.
    pub fn take(&self, max: usize) -> Drained {
        let mut shared = lock(&self.shared);
        let count = max.min(shared.buffer.len());
        let bytes: Vec<u8> = shared.buffer.drain(..count).collect();
        let space_freed = shared.blocked && count > 0;
        if space_freed {
            shared.blocked = false;
        }
        Drained { bytes, space_freed }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    /// Waits until the session writes more bytes or closes the pipe.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

pub fn outbound_pipe(capacity: usize) -> (OutboundPipe, OutboundDrain) {
    let shared = Arc::new(Mutex::new(OutboundShared {
        buffer: VecDeque::with_capacity(capacity),
        capacity: capacity.max(1),
        closed: false,
        blocked: false,
    }));
    let notify = Arc::new(Notify::new());
    (
        OutboundPipe {
            shared: shared.clone(),
            notify: notify.clone(),
        },
        OutboundDrain { shared, notify },
    )
}
