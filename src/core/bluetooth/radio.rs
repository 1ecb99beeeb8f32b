//! The radio stack as seen by the connection state machine.

use uuid::Uuid;

use super::types::{ConnectOptions, LinkState, PeripheralId, RadioPower};

/// Requests to the radio stack.
///
/// Every request returns immediately; its outcome arrives later as a
/// [`RadioEvent`](super::types::RadioEvent) on the engine's event queue. Queries
/// answer from the stack's current view without waiting.
pub trait Radio: Send {
    fn power(&self) -> RadioPower;

    fn is_scanning(&self) -> bool;

    /// Starts scanning for peripherals advertising `service`.
    fn start_scan(&mut self, service: Uuid);

    fn stop_scan(&mut self);

    /// Peripherals with `service` that are already linked to this host.
    fn connected_peripherals(&self, service: Uuid) -> Vec<PeripheralId>;

    fn link_state(&self, peripheral: &PeripheralId) -> LinkState;

    fn connect(&mut self, peripheral: &PeripheralId, options: ConnectOptions);

    /// Tears the link down. A user cancel is never auto-reconnected.
    fn cancel_connection(&mut self, peripheral: &PeripheralId);

    fn discover_services(&mut self, peripheral: &PeripheralId, service: Uuid);

    fn discover_characteristics(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid);

    fn subscribe(&mut self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid);

    /// Opens the L2CAP channel on `psm`.
    fn open_channel(&mut self, peripheral: &PeripheralId, psm: u16);
}
