//! Connection state machine for the glasses
//! Discovers, connects, restores and reconnects the peripheral, and owns the channel session.

use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::radio_config::RadioConfig;
use crate::core::bluetooth::constants::MAX_CHANNEL_REOPENS;
use crate::core::bluetooth::identity::IdentityStore;
use crate::core::bluetooth::radio::Radio;
use crate::core::bluetooth::types::{
    CharacteristicInfo, ConnectOptions, ConnectionState, LinkState, PeripheralId, RadioEvent,
    RadioPower, RestoredPeripheral,
};
use crate::core::events::{Event, EventSender, post};
use crate::core::transport::{
    ChannelSession, ChannelStreams, FrameSubmitter, SendCompletion, SendError, SessionOutcome,
    StreamEvent, TransportError,
};

/// Why an explicit connect request did nothing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectRejected {
    #[error("Bluetooth is not powered on")]
    RadioUnavailable,

    #[error("cannot start a scan while {0}")]
    Busy(ConnectionState),

    #[error("already scanning for peripherals")]
    AlreadyScanning,

    #[error("already connected/connecting to peripheral {0}")]
    PeripheralActive(PeripheralId),
}

/// Channel session slot; operations on a session only exist in `Open`.
enum SessionSlot {
    NoSession,
    /// Channel open requested, streams not handed over yet.
    Opening(PeripheralId),
    Open(ChannelSession),
}

pub struct ConnectionManager<R: Radio> {
    radio: R,
    identity: Box<dyn IdentityStore>,
    config: RadioConfig,
    events: EventSender,
    state: watch::Sender<ConnectionState>,
    /// Peripheral being connected or connected to
    peripheral: Option<PeripheralId>,
    restored: Option<RestoredPeripheral>,
    was_restored: bool,
    manual_disconnect: bool,
    /// Channel reopens on the current link since its channel last came up
    channel_reopens: u32,
    /// Bumped whenever a scan starts or ends so late timers can be told apart
    scan_attempt: u64,
    session: SessionSlot,
}

impl<R: Radio> ConnectionManager<R> {
    pub fn new(radio: R, identity: Box<dyn IdentityStore>, config: RadioConfig, events: EventSender) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            radio,
            identity,
            config,
            events,
            state,
            peripheral: None,
            restored: None,
            was_restored: false,
            manual_disconnect: false,
            channel_reopens: 0,
            scan_attempt: 0,
            session: SessionSlot::NoSession,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn peripheral(&self) -> Option<&PeripheralId> {
        self.peripheral.as_ref()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// The open channel session, if any.
    pub fn session(&self) -> Option<&ChannelSession> {
        match &self.session {
            SessionSlot::Open(session) => Some(session),
            _ => None,
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("BLE state changed from {} to {}", previous, next);
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default()
    }

    fn saved_peripheral(&self) -> Option<PeripheralId> {
        match self.identity.load() {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not read saved peripheral: {}", e);
                None
            }
        }
    }

    /// Manual connection attempt: scans for the glasses.
    pub fn connect(&mut self) -> Result<(), ConnectRejected> {
        if self.radio.power() != RadioPower::PoweredOn {
            return Err(ConnectRejected::RadioUnavailable);
        }

        let state = self.state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Disconnected) {
            return Err(ConnectRejected::Busy(state));
        }

        if self.radio.is_scanning() {
            return Err(ConnectRejected::AlreadyScanning);
        }

        if let Some(peripheral) = &self.peripheral {
            if matches!(
                self.radio.link_state(peripheral),
                LinkState::Connected | LinkState::Connecting
            ) {
                return Err(ConnectRejected::PeripheralActive(peripheral.clone()));
            }
        }

        self.set_state(ConnectionState::Scanning);
        info!("Scanning for peripherals");
        self.radio.start_scan(self.config.service_uuid);

        self.scan_attempt += 1;
        let attempt = self.scan_attempt;
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            post(&events, Event::ScanTimeout { attempt });
        });
        Ok(())
    }

    /// User-initiated disconnect. Also forgets the saved peripheral.
    pub fn disconnect(&mut self) {
        if let Err(e) = self.identity.clear() {
            warn!("Failed to clear saved peripheral: {}", e);
        }

        if self.state() == ConnectionState::Scanning {
            info!("Stopping scan on user request");
            self.radio.stop_scan();
            self.scan_attempt += 1;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let Some(peripheral) = self.peripheral.clone() else {
            info!("No peripheral to disconnect from");
            self.teardown_session();
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        match self.radio.link_state(&peripheral) {
            LinkState::Connected | LinkState::Connecting | LinkState::Disconnecting => {
                self.manual_disconnect = true;
                info!("Disconnecting from peripheral: {}", peripheral);
                self.radio.cancel_connection(&peripheral);
                // the rest happens on the Disconnected event
            }
            LinkState::Disconnected => {
                info!("Peripheral is already disconnected");
                self.teardown_session();
                self.peripheral = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    pub fn on_scan_timeout(&mut self, attempt: u64) {
        if attempt != self.scan_attempt || self.state() != ConnectionState::Scanning {
            debug!("Ignoring stale scan timeout #{}", attempt);
            return;
        }
        self.radio.stop_scan();
        self.scan_attempt += 1;
        info!("Scanning timed out");
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PowerChanged(power) => self.on_power_changed(power),
            RadioEvent::WillRestore(peripherals) => self.on_will_restore(peripherals),
            RadioEvent::Discovered { peripheral, name, rssi } => {
                self.on_discovered(peripheral, name, rssi)
            }
            RadioEvent::Connected(peripheral) => {
                if self.peripheral.as_ref() != Some(&peripheral) {
                    warn!("Ignoring connection of untracked peripheral {}", peripheral);
                    return;
                }
                self.on_link_connected(peripheral);
            }
            RadioEvent::ConnectFailed { peripheral, reason } => {
                if self.peripheral.as_ref() != Some(&peripheral) {
                    return;
                }
                error!("Failed to connect to peripheral: {}, error: {}", peripheral, reason);
                self.teardown_session();
                self.peripheral = None;
                self.set_state(ConnectionState::Disconnected);
            }
            RadioEvent::Disconnected {
                peripheral,
                reconnecting,
                reason,
            } => self.on_disconnected(peripheral, reconnecting, reason),
            RadioEvent::ServicesDiscovered { peripheral, result } => match result {
                Ok(services) => {
                    debug!("Discovered services: {:?}", services);
                    if services.contains(&self.config.service_uuid) {
                        info!(
                            "Found target service: {}, discovering characteristics",
                            self.config.service_uuid
                        );
                        self.radio.discover_characteristics(
                            &peripheral,
                            self.config.service_uuid,
                            self.config.keep_alive_uuid,
                        );
                    } else {
                        warn!(
                            "Target service ({}) not found among discovered services",
                            self.config.service_uuid
                        );
                    }
                }
                Err(e) => error!("Error discovering services: {}", e),
            },
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => match result {
                Ok(characteristics) => self.on_characteristics(peripheral, service, &characteristics),
                Err(e) => error!("Error discovering characteristics for service {}: {}", service, e),
            },
            RadioEvent::NotificationStateChanged {
                characteristic,
                result,
                ..
            } => match result {
                Ok(true) => info!("Subscribed to notifications for characteristic: {}", characteristic),
                Ok(false) => info!("Unsubscribed from notifications for characteristic: {}", characteristic),
                Err(e) => error!("Error changing notification state for {}: {}", characteristic, e),
            },
            RadioEvent::ValueUpdated {
                characteristic, value, ..
            } => {
                if characteristic == self.config.keep_alive_uuid {
                    debug!("Keep-alive notification received ({} bytes)", value.len());
                }
            }
            RadioEvent::ChannelOpened { peripheral, result } => self.on_channel_opened(peripheral, result),
        }
    }

    fn on_power_changed(&mut self, power: RadioPower) {
        match power {
            RadioPower::PoweredOn => {
                if matches!(
                    self.state(),
                    ConnectionState::Scanning | ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    debug!("Power-on while {}, nothing to do", self.state());
                    return;
                }
                info!("Bluetooth is powered on");
                self.set_state(ConnectionState::Idle);
                if self.was_restored {
                    self.reconnect_on_restore();
                } else {
                    self.reconnect_to_saved();
                }
            }
            RadioPower::PoweredOff => {
                info!("Bluetooth is powered off");
                self.reset_link();
            }
            RadioPower::Unknown => {
                warn!("Bluetooth unknown state");
                self.reset_link();
            }
        }
    }

    /// Drops every reference to the peripheral and the session.
    fn reset_link(&mut self) {
        self.scan_attempt += 1;
        self.teardown_session();
        self.peripheral = None;
        self.restored = None;
        self.was_restored = false;
        self.manual_disconnect = false;
        self.channel_reopens = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_will_restore(&mut self, peripherals: Vec<RestoredPeripheral>) {
        info!("Restoring state ({} peripherals)", peripherals.len());
        self.was_restored = true;

        let Some(saved) = self.saved_peripheral() else {
            info!("No saved peripheral to match against restored peripherals");
            return;
        };
        match peripherals.into_iter().find(|p| p.id == saved) {
            Some(restored) => {
                info!("Found our saved peripheral in restored list: {}", restored.id);
                self.restored = Some(restored);
            }
            None => info!("Saved peripheral {} not found among restored peripherals", saved),
        }
    }

    fn reconnect_on_restore(&mut self) {
        info!("Attempting to reconnect on restore");
        self.was_restored = false;

        let Some(restored) = self.restored.take() else {
            info!("No restored peripheral found");
            self.reconnect_to_saved();
            return;
        };

        let id = restored.id;
        self.peripheral = Some(id.clone());
        self.set_state(ConnectionState::Connecting);
        match restored.link {
            LinkState::Connected => {
                info!("Restored peripheral is already connected");
                self.on_link_connected(id);
            }
            LinkState::Connecting => info!("Restored peripheral is already connecting"),
            LinkState::Disconnected | LinkState::Disconnecting => {
                info!("Restored peripheral is not connected");
                let options = self.connect_options();
                self.radio.connect(&id, options);
            }
        }
    }

    fn reconnect_to_saved(&mut self) {
        let Some(saved) = self.saved_peripheral() else {
            info!("No saved peripheral found");
            return;
        };

        if self
            .radio
            .connected_peripherals(self.config.service_uuid)
            .contains(&saved)
        {
            info!("Already connected to saved peripheral");
            self.peripheral = Some(saved.clone());
            self.set_state(ConnectionState::Connecting);
            self.on_link_connected(saved);
            return;
        }

        info!("Attempting to connect to saved peripheral {}", saved);
        self.peripheral = Some(saved.clone());
        self.set_state(ConnectionState::Connecting);
        let options = self.connect_options();
        self.radio.connect(&saved, options);
    }

    fn on_discovered(&mut self, peripheral: PeripheralId, name: Option<String>, rssi: Option<i16>) {
        if self.state() != ConnectionState::Scanning {
            debug!("Ignoring discovery of {} outside a scan", peripheral);
            return;
        }
        info!(
            "Discovered peripheral: {} ({}), RSSI: {:?}",
            name.as_deref().unwrap_or("unknown"),
            peripheral,
            rssi
        );

        self.radio.stop_scan();
        self.scan_attempt += 1;
        self.peripheral = Some(peripheral.clone());

        info!("Connecting to peripheral: {}", peripheral);
        self.set_state(ConnectionState::Connecting);
        let options = self.connect_options();
        self.radio.connect(&peripheral, options);
    }

    /// Link is up: remember the peripheral, discover services and open the channel.
    /// `Connected` is only entered once the channel's streams have opened.
    fn on_link_connected(&mut self, peripheral: PeripheralId) {
        if let Err(e) = self.identity.save(&peripheral) {
            warn!("Failed to save peripheral {}: {}", peripheral, e);
        }

        self.teardown_session();
        self.channel_reopens = 0;
        self.set_state(ConnectionState::Connecting);
        self.radio.discover_services(&peripheral, self.config.service_uuid);
        info!("Connected to peripheral: {}", peripheral);
        self.open_channel(peripheral);
    }

    fn open_channel(&mut self, peripheral: PeripheralId) {
        info!("Opening L2CAP channel on PSM {} to {}", self.config.psm, peripheral);
        self.radio.open_channel(&peripheral, self.config.psm);
        self.session = SessionSlot::Opening(peripheral);
    }

    fn on_characteristics(&mut self, peripheral: PeripheralId, service: uuid::Uuid, characteristics: &[CharacteristicInfo]) {
        let keep_alive = characteristics
            .iter()
            .find(|c| c.uuid == self.config.keep_alive_uuid);
        match keep_alive {
            Some(c) if c.notify => {
                info!("Keep-alive characteristic supports notify, subscribing");
                self.radio.subscribe(&peripheral, service, c.uuid);
            }
            Some(c) => warn!("Keep-alive characteristic {} does not support notify", c.uuid),
            None => warn!("Keep-alive characteristic not found for service {}", service),
        }
    }

    fn on_channel_opened(&mut self, peripheral: PeripheralId, result: Result<ChannelStreams, String>) {
        let expected = matches!(&self.session, SessionSlot::Opening(p) if *p == peripheral);
        if !expected {
            warn!("Unexpected channel from {}, closing it", peripheral);
            if let Ok(mut streams) = result {
                streams.close();
            }
            return;
        }

        match result {
            Ok(streams) => {
                info!("Setting up L2CAP streams");
                self.session = SessionSlot::Open(ChannelSession::open(
                    streams,
                    self.config.mtu,
                    self.config.max_frame_len,
                ));
            }
            Err(e) => {
                error!("Failed to open L2CAP channel: {}", e);
                self.session = SessionSlot::NoSession;
                self.manual_disconnect = true;
                self.radio.cancel_connection(&peripheral);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Routes a stream notification into the session. Returns completed inbound frames.
    pub fn handle_stream_event(&mut self, event: StreamEvent) -> Vec<Vec<u8>> {
        let SessionSlot::Open(session) = &mut self.session else {
            debug!("Stream event {:?} without an open session", event);
            return Vec::new();
        };

        match session.handle_event(event) {
            SessionOutcome::Nothing => Vec::new(),
            SessionOutcome::Opened => {
                self.channel_reopens = 0;
                self.set_state(ConnectionState::Connected);
                Vec::new()
            }
            SessionOutcome::Frames(frames) => frames,
            SessionOutcome::Terminated(e) => {
                self.on_stream_terminated(e);
                Vec::new()
            }
        }
    }

    /// The channel died. On a live link the channel is opened again; otherwise the
    /// link events decide, so the stack's own reconnect stays in effect.
    fn on_stream_terminated(&mut self, reason: TransportError) {
        match reason {
            TransportError::EndOfStream => info!("Stream end encountered"),
            other => error!("Stream error occurred: {}", other),
        }
        self.teardown_session();

        let Some(peripheral) = self.peripheral.clone() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        match self.radio.link_state(&peripheral) {
            LinkState::Connected if self.channel_reopens < MAX_CHANNEL_REOPENS => {
                self.channel_reopens += 1;
                info!(
                    "Link to {} is still up, reopening channel (attempt {})",
                    peripheral, self.channel_reopens
                );
                self.set_state(ConnectionState::Connecting);
                self.open_channel(peripheral);
            }
            LinkState::Connected => {
                warn!("Channel to {} keeps failing, dropping the link", peripheral);
                self.radio.cancel_connection(&peripheral);
                self.set_state(ConnectionState::Disconnected);
            }
            LinkState::Connecting => self.set_state(ConnectionState::Connecting),
            LinkState::Disconnecting | LinkState::Disconnected => {
                info!("Link to {} is going down", peripheral);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId, reconnecting: bool, reason: Option<String>) {
        if self.peripheral.as_ref() != Some(&peripheral) {
            debug!("Ignoring disconnect of untracked peripheral {}", peripheral);
            return;
        }

        self.teardown_session();
        if reconnecting && !self.manual_disconnect {
            info!("Reconnecting to disconnected peripheral: {}", peripheral);
            self.set_state(ConnectionState::Connecting);
        } else {
            match reason {
                Some(reason) => info!("Disconnected from peripheral: {} ({})", peripheral, reason),
                None => info!("Disconnected from peripheral: {}", peripheral),
            }
            self.manual_disconnect = false;
            self.peripheral = None;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn teardown_session(&mut self) {
        if let SessionSlot::Open(session) = std::mem::replace(&mut self.session, SessionSlot::NoSession) {
            session.close();
        }
    }
}

impl<R: Radio> FrameSubmitter for ConnectionManager<R> {
    fn submit_frame(&mut self, payload: &[u8], completion: SendCompletion) -> Result<(), SendError> {
        match &mut self.session {
            SessionSlot::Open(session) if session.is_open() => session.submit(payload, completion),
            _ => Err(SendError::NoSession),
        }
    }
}
