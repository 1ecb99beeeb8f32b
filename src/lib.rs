//! Glimpse companion library
//! Receives images from the glasses over an L2CAP channel, turns them into
//! speech through external services and sends the audio back.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
