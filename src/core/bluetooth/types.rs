//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::transport::ChannelStreams;

/// Connection lifecycle as observed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Stable identifier of the paired glasses, as handed out by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link-layer state of one peripheral as the radio stack sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPower {
    PoweredOn,
    PoweredOff,
    /// Unsupported, unauthorized, resetting or not yet known
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Ask the stack to re-establish the link by itself after it drops.
    pub auto_reconnect: bool,
    pub notify_on_connection: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            notify_on_connection: true,
        }
    }
}

/// A peripheral handed back by the stack when the process is relaunched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredPeripheral {
    pub id: PeripheralId,
    pub link: LinkState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notify: bool,
}

/// Everything the radio stack reports, one variant per callback.
#[derive(Debug)]
pub enum RadioEvent {
    PowerChanged(RadioPower),
    /// Delivered before the first power notification after a relaunch.
    WillRestore(Vec<RestoredPeripheral>),
    Discovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    Disconnected {
        peripheral: PeripheralId,
        /// The stack is already trying to bring the link back.
        reconnecting: bool,
        reason: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        result: Result<Vec<CharacteristicInfo>, String>,
    },
    NotificationStateChanged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<bool, String>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ChannelOpened {
        peripheral: PeripheralId,
        result: Result<ChannelStreams, String>,
    },
}
