//! Bluetooth functionality for the Glimpse companion
//! This module handles the radio side: scanning, connecting, restoring and
//! reconnecting the glasses, and opening the L2CAP channel to them.

#[cfg(feature = "radio-bluest")]
mod bluest_radio;
mod connection;
mod constants;
mod identity;
mod radio;
mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "radio-bluest")]
pub use bluest_radio::BluestRadio;
pub use connection::{ConnectRejected, ConnectionManager};
pub use constants::*;
pub use identity::{FileIdentityStore, IdentityStore, IdentityWriter, MemoryIdentityStore, StoreError};
pub use radio::Radio;
pub use types::{
    CharacteristicInfo, ConnectOptions, ConnectionState, LinkState, PeripheralId, RadioEvent,
    RadioPower, RestoredPeripheral,
};
