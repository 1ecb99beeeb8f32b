//! `Radio` implemented on the bluest adapter
//! Every request runs on its own task and reports back through the engine's queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device, DeviceId};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::radio_config::RadioConfig;
use crate::core::bluetooth::constants::{OUTBOUND_PIPE_MTUS, RECONNECT_RETRY_DELAY_MS};
use crate::core::bluetooth::radio::Radio;
use crate::core::bluetooth::types::{
    CharacteristicInfo, ConnectOptions, LinkState, PeripheralId, RadioEvent, RadioPower,
    RestoredPeripheral,
};
use crate::core::events::{Event, EventSender, post};
use crate::core::transport::{
    ChannelId, ChannelStreams, StreamDirection, StreamEvent, StreamEventKind, inbound_pipe, outbound_pipe,
};

#[derive(Default)]
struct Shared {
    power: Option<RadioPower>,
    scanning: bool,
    devices: HashMap<PeripheralId, Device>,
    links: HashMap<PeripheralId, LinkState>,
    /// Linked peripherals carrying the target service
    connected: Vec<PeripheralId>,
    characteristics: HashMap<(PeripheralId, Uuid), Characteristic>,
    /// Watchers re-establishing dropped links
    watchers: HashMap<PeripheralId, CancellationToken>,
    cancelled: HashSet<PeripheralId>,
    last_channel: ChannelId,
}

fn peripheral_id(device: &Device) -> PeripheralId {
    match serde_json::to_string(&device.id()) {
        Ok(id) => PeripheralId::new(id),
        Err(_) => PeripheralId::new(device.id().to_string()),
    }
}

fn device_id(peripheral: &PeripheralId) -> Result<DeviceId> {
    serde_json::from_str(peripheral.as_str())
        .map_err(|e| anyhow!("Invalid peripheral id {}: {}", peripheral, e))
}

/// Adapter handle shared by the request tasks.
#[derive(Clone)]
struct Backend {
    adapter: Adapter,
    shared: Arc<Mutex<Shared>>,
    events: EventSender,
}

impl Backend {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn post(&self, event: RadioEvent) {
        post(&self.events, Event::Radio(event));
    }

    fn post_stream(&self, channel: ChannelId, direction: StreamDirection, kind: StreamEventKind) {
        post(&self.events, Event::Stream(StreamEvent::new(channel, direction, kind)));
    }

    fn set_link(&self, peripheral: &PeripheralId, link: LinkState) {
        self.shared().links.insert(peripheral.clone(), link);
    }

    fn remember(&self, device: &Device) -> PeripheralId {
        let id = peripheral_id(device);
        self.shared().devices.insert(id.clone(), device.clone());
        id
    }

    async fn device(&self, peripheral: &PeripheralId) -> Result<Device> {
        let known = self.shared().devices.get(peripheral).cloned();
        if let Some(device) = known {
            return Ok(device);
        }
        let device = self.adapter.open_device(&device_id(peripheral)?).await?;
        self.shared().devices.insert(peripheral.clone(), device.clone());
        Ok(device)
    }

    /// Waits for the adapter, reports restorable peripherals, then follows power changes.
    async fn watch_adapter(self, service: Uuid) -> Result<()> {
        self.adapter.wait_available().await?;

        let linked = self.adapter.connected_devices_with_services(&[service]).await?;
        let restored: Vec<RestoredPeripheral> = linked
            .iter()
            .map(|device| {
                let id = self.remember(device);
                self.set_link(&id, LinkState::Connected);
                RestoredPeripheral {
                    id,
                    link: LinkState::Connected,
                }
            })
            .collect();
        self.shared().connected = restored.iter().map(|p| p.id.clone()).collect();
        if !restored.is_empty() {
            info!("{} peripheral(s) already linked", restored.len());
            self.post(RadioEvent::WillRestore(restored));
        }

        self.shared().power = Some(RadioPower::PoweredOn);
        self.post(RadioEvent::PowerChanged(RadioPower::PoweredOn));

        let mut events = self.adapter.events().await?;
        while let Some(event) = events.next().await {
            let power = match event {
                Ok(AdapterEvent::Available) => RadioPower::PoweredOn,
                Ok(AdapterEvent::Unavailable) => RadioPower::PoweredOff,
                Err(e) => {
                    warn!("Adapter event error: {}", e);
                    RadioPower::Unknown
                }
            };
            let changed = self.shared().power.replace(power) != Some(power);
            if changed {
                if power != RadioPower::PoweredOn {
                    let mut shared = self.shared();
                    shared.scanning = false;
                    shared.links.clear();
                    shared.connected.clear();
                    for (_, watcher) in shared.watchers.drain() {
                        watcher.cancel();
                    }
                }
                self.post(RadioEvent::PowerChanged(power));
            }
        }
        Ok(())
    }

    async fn scan(self, service: Uuid, cancel: CancellationToken) -> Result<()> {
        let mut stream = self.adapter.scan(&[service]).await?;
        loop {
            tokio::select! {
                result = stream.next() => {
                    let Some(discovered) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let device = discovered.device;
                    debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered.rssi);
                    let peripheral = self.remember(&device);
                    self.post(RadioEvent::Discovered {
                        peripheral,
                        name: device.name().ok(),
                        rssi: discovered.rssi,
                    });
                }
                _ = cancel.cancelled() => break,
            }
        }
        if !cancel.is_cancelled() {
            self.shared().scanning = false;
        }
        Ok(())
    }

    async fn connect(self, peripheral: PeripheralId, options: ConnectOptions) {
        self.shared().cancelled.remove(&peripheral);
        let result = async {
            let device = self.device(&peripheral).await?;
            if !device.is_connected().await {
                info!("Initiating connection to {}...", peripheral);
                self.adapter.connect_device(&device).await?;
            }
            Ok::<Device, anyhow::Error>(device)
        }
        .await;

        match result {
            Ok(device) => {
                self.set_link(&peripheral, LinkState::Connected);
                if options.notify_on_connection {
                    info!("Connection to {} established", peripheral);
                }
                self.post(RadioEvent::Connected(peripheral.clone()));
                if options.auto_reconnect {
                    self.spawn_watcher(peripheral, device);
                }
            }
            Err(e) => {
                self.set_link(&peripheral, LinkState::Disconnected);
                self.post(RadioEvent::ConnectFailed {
                    peripheral,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn spawn_watcher(&self, peripheral: PeripheralId, device: Device) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.shared().watchers.insert(peripheral.clone(), cancel.clone()) {
            previous.cancel();
        }
        let backend = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = backend.clone().watch_link(peripheral.clone(), device, cancel.clone()) => {
                    if let Err(e) = result {
                        error!("Link watcher for {} failed: {}", peripheral, e);
                    }
                }
                _ = cancel.cancelled() => debug!("Link watcher for {} stopped", peripheral),
            }
        });
    }

    /// Follows one device's link and brings it back after an unrequested drop.
    async fn watch_link(self, peripheral: PeripheralId, device: Device, cancel: CancellationToken) -> Result<()> {
        let mut events = self.adapter.device_connection_events(&device).await?;
        while let Some(event) = events.next().await {
            if !matches!(event, ConnectionEvent::Disconnected) {
                continue;
            }
            if self.shared().cancelled.contains(&peripheral) {
                break;
            }

            warn!("Link to {} dropped, reconnecting", peripheral);
            self.set_link(&peripheral, LinkState::Connecting);
            self.post(RadioEvent::Disconnected {
                peripheral: peripheral.clone(),
                reconnecting: true,
                reason: Some("link lost".to_string()),
            });

            while !cancel.is_cancelled() {
                match self.adapter.connect_device(&device).await {
                    Ok(()) => {
                        self.set_link(&peripheral, LinkState::Connected);
                        self.post(RadioEvent::Connected(peripheral.clone()));
                        break;
                    }
                    Err(e) => {
                        debug!("Reconnect to {} failed: {}", peripheral, e);
                        tokio::time::sleep(Duration::from_millis(RECONNECT_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn cancel(self, peripheral: PeripheralId) {
        {
            let mut shared = self.shared();
            shared.cancelled.insert(peripheral.clone());
            if let Some(watcher) = shared.watchers.remove(&peripheral) {
                watcher.cancel();
            }
            shared.links.insert(peripheral.clone(), LinkState::Disconnecting);
        }

        let reason = match self.device(&peripheral).await {
            Ok(device) => match self.adapter.disconnect_device(&device).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };
        {
            let mut shared = self.shared();
            shared.links.insert(peripheral.clone(), LinkState::Disconnected);
            shared.connected.retain(|p| *p != peripheral);
            shared.characteristics.retain(|(p, _), _| *p != peripheral);
        }
        self.post(RadioEvent::Disconnected {
            peripheral,
            reconnecting: false,
            reason,
        });
    }

    async fn discover_services(self, peripheral: PeripheralId, service: Uuid) {
        let result = async {
            let device = self.device(&peripheral).await?;
            let services = device.discover_services_with_uuid(service).await?;
            Ok::<Vec<Uuid>, anyhow::Error>(services.iter().map(|s| s.uuid()).collect())
        }
        .await;
        self.post(RadioEvent::ServicesDiscovered {
            peripheral,
            result: result.map_err(|e| e.to_string()),
        });
    }

    async fn discover_characteristics(self, peripheral: PeripheralId, service: Uuid, characteristic: Uuid) {
        let result = async {
            let device = self.device(&peripheral).await?;
            let mut found = Vec::new();
            for svc in device.discover_services_with_uuid(service).await? {
                for c in svc.discover_characteristics_with_uuid(characteristic).await? {
                    let notify = c.properties().await.map(|p| p.notify).unwrap_or(false);
                    found.push(CharacteristicInfo { uuid: c.uuid(), notify });
                    self.shared()
                        .characteristics
                        .insert((peripheral.clone(), c.uuid()), c);
                }
            }
            Ok::<Vec<CharacteristicInfo>, anyhow::Error>(found)
        }
        .await;
        self.post(RadioEvent::CharacteristicsDiscovered {
            peripheral,
            service,
            result: result.map_err(|e| e.to_string()),
        });
    }

    async fn subscribe(self, peripheral: PeripheralId, characteristic: Uuid) {
        let known = self
            .shared()
            .characteristics
            .get(&(peripheral.clone(), characteristic))
            .cloned();
        let Some(handle) = known else {
            self.post(RadioEvent::NotificationStateChanged {
                peripheral,
                characteristic,
                result: Err("characteristic not discovered".to_string()),
            });
            return;
        };

        let mut stream = match handle.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                self.post(RadioEvent::NotificationStateChanged {
                    peripheral,
                    characteristic,
                    result: Err(e.to_string()),
                });
                return;
            }
        };
        self.post(RadioEvent::NotificationStateChanged {
            peripheral: peripheral.clone(),
            characteristic,
            result: Ok(true),
        });

        while let Some(value) = stream.next().await {
            match value {
                Ok(value) => self.post(RadioEvent::ValueUpdated {
                    peripheral: peripheral.clone(),
                    characteristic,
                    value,
                }),
                Err(e) => {
                    warn!("Notification error on {}: {}", characteristic, e);
                    break;
                }
            }
        }
        self.post(RadioEvent::NotificationStateChanged {
            peripheral,
            characteristic,
            result: Ok(false),
        });
    }

    /// Opens the L2CAP channel and pumps it through the session pipes.
    async fn open_channel(self, peripheral: PeripheralId, psm: u16, mtu: usize) {
        let channel = async {
            let device = self.device(&peripheral).await?;
            Ok::<_, anyhow::Error>(device.open_l2cap_channel(psm, false).await?)
        }
        .await;
        let channel = match channel {
            Ok(channel) => channel,
            Err(e) => {
                self.post(RadioEvent::ChannelOpened {
                    peripheral,
                    result: Err(e.to_string()),
                });
                return;
            }
        };

        let id = {
            let mut shared = self.shared();
            shared.last_channel += 1;
            shared.last_channel
        };
        debug!("L2CAP channel {} opened to {}", id, peripheral);
        let (mut reader, mut writer) = tokio::io::split(channel);
        let (feeder, inbound) = inbound_pipe();
        let (outbound, drain) = outbound_pipe(mtu * OUTBOUND_PIPE_MTUS);
        self.post(RadioEvent::ChannelOpened {
            peripheral,
            result: Ok(ChannelStreams::new(id, Box::new(inbound), Box::new(outbound))),
        });
        self.post_stream(id, StreamDirection::Inbound, StreamEventKind::OpenCompleted);
        self.post_stream(id, StreamDirection::Outbound, StreamEventKind::OpenCompleted);
        self.post_stream(id, StreamDirection::Outbound, StreamEventKind::HasSpaceAvailable);

        let backend = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu.max(1)];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        if !feeder.is_closed() {
                            backend.post_stream(id, StreamDirection::Inbound, StreamEventKind::EndEncountered);
                        }
                        break;
                    }
                    Ok(n) => {
                        if !feeder.push(&buf[..n]) {
                            break;
                        }
                        backend.post_stream(id, StreamDirection::Inbound, StreamEventKind::HasBytesAvailable);
                    }
                    Err(e) => {
                        if !feeder.is_closed() {
                            backend.post_stream(
                                id,
                                StreamDirection::Inbound,
                                StreamEventKind::ErrorOccurred(e.to_string()),
                            );
                        }
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let drained = drain.take(mtu.max(1));
                if drained.bytes.is_empty() {
                    if drain.is_closed() {
                        break;
                    }
                    drain.wait().await;
                    continue;
                }
                if let Err(e) = writer.write_all(&drained.bytes).await {
                    if !drain.is_closed() {
                        self.post_stream(id, StreamDirection::Outbound, StreamEventKind::ErrorOccurred(e.to_string()));
                    }
                    break;
                }
                if drained.space_freed {
                    self.post_stream(id, StreamDirection::Outbound, StreamEventKind::HasSpaceAvailable);
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!("Closing L2CAP writer: {}", e);
            }
        });
    }
}

/// Radio backed by the system Bluetooth adapter
pub struct BluestRadio {
    backend: Backend,
    mtu: usize,
    scan: Option<CancellationToken>,
}

impl BluestRadio {
    /// Opens the default adapter and starts following its power state.
    pub async fn start(config: &RadioConfig, events: EventSender) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        let backend = Backend {
            adapter,
            shared: Arc::new(Mutex::new(Shared::default())),
            events,
        };

        let watcher = backend.clone();
        let service = config.service_uuid;
        tokio::spawn(async move {
            if let Err(e) = watcher.clone().watch_adapter(service).await {
                error!("Adapter watcher failed: {}", e);
                watcher.shared().power = Some(RadioPower::Unknown);
                watcher.post(RadioEvent::PowerChanged(RadioPower::Unknown));
            }
        });

        Ok(Self {
            backend,
            mtu: config.mtu,
            scan: None,
        })
    }
}

impl Radio for BluestRadio {
    fn power(&self) -> RadioPower {
        self.backend.shared().power.unwrap_or(RadioPower::Unknown)
    }

    fn is_scanning(&self) -> bool {
        self.backend.shared().scanning
    }

    fn start_scan(&mut self, service: Uuid) {
        self.stop_scan();
        let cancel = CancellationToken::new();
        self.scan = Some(cancel.clone());
        self.backend.shared().scanning = true;

        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.clone().scan(service, cancel).await {
                error!("Scan failed: {}", e);
                backend.shared().scanning = false;
            }
        });
        info!("Device scan task started.");
    }

    fn stop_scan(&mut self) {
        if let Some(cancel) = self.scan.take() {
            info!("Stopping Bluetooth scan.");
            cancel.cancel();
        }
        self.backend.shared().scanning = false;
    }

    fn connected_peripherals(&self, _service: Uuid) -> Vec<PeripheralId> {
        self.backend.shared().connected.clone()
    }

    fn link_state(&self, peripheral: &PeripheralId) -> LinkState {
        self.backend
            .shared()
            .links
            .get(peripheral)
            .copied()
            .unwrap_or(LinkState::Disconnected)
    }

    fn connect(&mut self, peripheral: &PeripheralId, options: ConnectOptions) {
        self.backend.set_link(peripheral, LinkState::Connecting);
        tokio::spawn(self.backend.clone().connect(peripheral.clone(), options));
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralId) {
        tokio::spawn(self.backend.clone().cancel(peripheral.clone()));
    }

    fn discover_services(&mut self, peripheral: &PeripheralId, service: Uuid) {
        tokio::spawn(self.backend.clone().discover_services(peripheral.clone(), service));
    }

    fn discover_characteristics(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        tokio::spawn(
            self.backend
                .clone()
                .discover_characteristics(peripheral.clone(), service, characteristic),
        );
    }

    fn subscribe(&mut self, peripheral: &PeripheralId, _service: Uuid, characteristic: Uuid) {
        tokio::spawn(self.backend.clone().subscribe(peripheral.clone(), characteristic));
    }

    fn open_channel(&mut self, peripheral: &PeripheralId, psm: u16) {
        tokio::spawn(self.backend.clone().open_channel(peripheral.clone(), psm, self.mtu));
    }
}
