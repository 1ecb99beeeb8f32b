//! Application commands
//! The user-facing actions, posted to the engine as events.

use crate::state::AppState;

/// Requests the engine acts on, in arrival order with everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    /// Scan for the glasses and bind to the first one found.
    Connect,
    /// Drop the link and forget the saved glasses.
    Disconnect,
    Shutdown,
}

/// Starts a manual connection attempt
///
/// Ignored by the engine unless Bluetooth is on and the state is `Idle` or
/// `Disconnected`; the outcome is observed through the connection state.
pub fn connect(app_state: &AppState) -> Result<(), String> {
    app_state.send(AppCommand::Connect).map_err(|e| e.to_string())
}

/// Disconnects from the glasses and forgets them
pub fn disconnect(app_state: &AppState) -> Result<(), String> {
    app_state.send(AppCommand::Disconnect).map_err(|e| e.to_string())
}
