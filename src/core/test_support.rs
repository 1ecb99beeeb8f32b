//! Fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::bluetooth::{ConnectOptions, LinkState, PeripheralId, Radio, RadioPower};
use crate::core::pipeline::{
    BackgroundExecution, ExpirationHandler, ImageDescriber, LeaseToken, ServiceError,
    SpeechSynthesizer,
};
use crate::core::transport::{
    ByteSink, ByteSource, ChannelId, ChannelStreams, StreamDirection, StreamEvent, StreamEventKind,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Inbound stream fed by the test. Clones share the buffer.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    buffer: Arc<Mutex<VecDeque<u8>>>,
}

impl ScriptedSource {
    pub fn push(&self, bytes: &[u8]) {
        lock(&self.buffer).extend(bytes);
    }
}

impl ByteSource for ScriptedSource {
    fn available(&self) -> usize {
        lock(&self.buffer).len()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buffer = lock(&self.buffer);
        let n = buf.len().min(buffer.len());
        for (slot, byte) in buf.iter_mut().zip(buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        lock(&self.buffer).clear();
    }
}

#[derive(Default)]
struct SinkState {
    limits: VecDeque<usize>,
    failing: bool,
    writes: Vec<usize>,
    bytes: Vec<u8>,
    closed: bool,
}

/// Outbound stream that records every accepted write. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    /// The n-th write accepts at most `limits[n]` bytes; later writes are unlimited.
    pub fn with_limits(limits: Vec<usize>) -> Self {
        let sink = Self::default();
        lock(&sink.state).limits = limits.into();
        sink
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        lock(&sink.state).failing = true;
        sink
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        lock(&self.state).writes.clone()
    }

    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.state).bytes.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl ByteSink for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link lost"));
        }
        let accepted = state.limits.pop_front().unwrap_or(usize::MAX).min(buf.len());
        state.writes.push(accepted);
        state.bytes.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}

/// Test-side ends of a channel created by [`open_streams`].
pub struct ChannelEnds {
    channel: ChannelId,
    inbound: ScriptedSource,
    outbound: RecordingSink,
}

impl ChannelEnds {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// A notification as this channel's streams would raise it.
    pub fn event(&self, direction: StreamDirection, kind: StreamEventKind) -> StreamEvent {
        StreamEvent::new(self.channel, direction, kind)
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.inbound.push(bytes);
    }

    pub fn sent(&self) -> Vec<u8> {
        self.outbound.bytes()
    }

    pub fn outbound_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// A fresh channel with its own id.
pub fn open_streams() -> (ChannelStreams, ChannelEnds) {
    let channel = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);
    let inbound = ScriptedSource::default();
    let outbound = RecordingSink::default();
    let streams = ChannelStreams::new(channel, Box::new(inbound.clone()), Box::new(outbound.clone()));
    (
        streams,
        ChannelEnds {
            channel,
            inbound,
            outbound,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan(Uuid),
    StopScan,
    Connect(PeripheralId, ConnectOptions),
    CancelConnection(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid, Uuid),
    Subscribe(PeripheralId, Uuid, Uuid),
    OpenChannel(PeripheralId, u16),
}

struct RadioState {
    power: RadioPower,
    scanning: bool,
    links: HashMap<PeripheralId, LinkState>,
    connected: Vec<PeripheralId>,
    calls: Vec<RadioCall>,
}

/// Radio that records requests; the test plays the stack's callbacks.
#[derive(Clone)]
pub struct FakeRadio {
    state: Arc<Mutex<RadioState>>,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                power: RadioPower::Unknown,
                scanning: false,
                links: HashMap::new(),
                connected: Vec::new(),
                calls: Vec::new(),
            })),
        }
    }
}

impl FakeRadio {
    pub fn set_power(&self, power: RadioPower) {
        lock(&self.state).power = power;
    }

    pub fn set_link(&self, peripheral: &PeripheralId, link: LinkState) {
        lock(&self.state).links.insert(peripheral.clone(), link);
    }

    /// Marks `peripheral` as already linked with the target service.
    pub fn add_connected(&self, peripheral: &PeripheralId) {
        let mut state = lock(&self.state);
        state.connected.push(peripheral.clone());
        state.links.insert(peripheral.clone(), LinkState::Connected);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: RadioCall) {
        lock(&self.state).calls.push(call);
    }
}

impl Radio for FakeRadio {
    fn power(&self) -> RadioPower {
        lock(&self.state).power
    }

    fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    fn start_scan(&mut self, service: Uuid) {
        lock(&self.state).scanning = true;
        self.record(RadioCall::StartScan(service));
    }

    fn stop_scan(&mut self) {
        lock(&self.state).scanning = false;
        self.record(RadioCall::StopScan);
    }

    fn connected_peripherals(&self, _service: Uuid) -> Vec<PeripheralId> {
        lock(&self.state).connected.clone()
    }

    fn link_state(&self, peripheral: &PeripheralId) -> LinkState {
        lock(&self.state)
            .links
            .get(peripheral)
            .copied()
            .unwrap_or(LinkState::Disconnected)
    }

    fn connect(&mut self, peripheral: &PeripheralId, options: ConnectOptions) {
        self.record(RadioCall::Connect(peripheral.clone(), options));
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralId) {
        self.record(RadioCall::CancelConnection(peripheral.clone()));
    }

    fn discover_services(&mut self, peripheral: &PeripheralId, _service: Uuid) {
        self.record(RadioCall::DiscoverServices(peripheral.clone()));
    }

    fn discover_characteristics(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        self.record(RadioCall::DiscoverCharacteristics(
            peripheral.clone(),
            service,
            characteristic,
        ));
    }

    fn subscribe(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        self.record(RadioCall::Subscribe(peripheral.clone(), service, characteristic));
    }

    fn open_channel(&mut self, peripheral: &PeripheralId, psm: u16) {
        self.record(RadioCall::OpenChannel(peripheral.clone(), psm));
    }
}

#[derive(Default)]
struct BackgroundState {
    next: u64,
    begun: Vec<LeaseToken>,
    ended: Vec<LeaseToken>,
    handlers: Vec<(LeaseToken, ExpirationHandler)>,
}

/// Background host that records begin/end and lets the test expire leases.
#[derive(Clone, Default)]
pub struct RecordingBackground {
    state: Arc<Mutex<BackgroundState>>,
}

impl RecordingBackground {
    pub fn begun(&self) -> Vec<LeaseToken> {
        lock(&self.state).begun.clone()
    }

    pub fn ended(&self) -> Vec<LeaseToken> {
        lock(&self.state).ended.clone()
    }

    /// Leases begun but not yet ended.
    pub fn active(&self) -> usize {
        let state = lock(&self.state);
        state.begun.len() - state.ended.len()
    }

    /// Runs the expiration handler of `token`, as the host would at budget exhaustion.
    pub fn expire(&self, token: LeaseToken) {
        let handler = {
            let mut state = lock(&self.state);
            let index = state.handlers.iter().position(|(t, _)| *t == token);
            index.map(|i| state.handlers.remove(i).1)
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl BackgroundExecution for RecordingBackground {
    fn begin(&self, _name: &str, on_expire: ExpirationHandler) -> LeaseToken {
        let mut state = lock(&self.state);
        state.next += 1;
        let token = LeaseToken::new(state.next);
        state.begun.push(token);
        state.handlers.push((token, on_expire));
        token
    }

    fn end(&self, token: LeaseToken) {
        let mut state = lock(&self.state);
        state.handlers.retain(|(t, _)| *t != token);
        state.ended.push(token);
    }
}

/// Describer answering from a fixed result; counts its calls.
#[derive(Clone)]
pub struct StubDescriber {
    result: Result<String, u16>,
    delay: Duration,
    calls: Arc<Mutex<Vec<usize>>>,
}

impl StubDescriber {
    pub fn answering(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn failing_with(status: u16) -> Self {
        Self {
            result: Err(status),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Image sizes seen so far.
    pub fn calls(&self) -> Vec<usize> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ImageDescriber for StubDescriber {
    async fn describe(&self, image: &[u8]) -> Result<String, ServiceError> {
        lock(&self.calls).push(image.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.result {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(ServiceError::Status {
                status: *status,
                body: "stubbed failure".into(),
            }),
        }
    }
}

/// Synthesizer returning the text's bytes prefixed with `AUDIO:`.
#[derive(Clone, Default)]
pub struct StubSynthesizer {
    calls: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl StubSynthesizer {
    pub fn failing() -> Self {
        Self {
            calls: Arc::default(),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError> {
        lock(&self.calls).push(text.to_string());
        if self.fail {
            return Err(ServiceError::Status {
                status: 500,
                body: "stubbed failure".into(),
            });
        }
        let mut audio = b"AUDIO:".to_vec();
        audio.extend_from_slice(text.as_bytes());
        Ok(audio)
    }
}
