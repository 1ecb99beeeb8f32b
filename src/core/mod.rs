//! Core functionality for the Glimpse companion
//! Radio connection, channel transport and the image-to-speech pipeline, all
//! driven by one engine task.

pub mod bluetooth;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use bluetooth::{ConnectionManager, ConnectionState};
pub use engine::Engine;
pub use events::{Event, EventReceiver, EventSender};
pub use pipeline::{Indication, PipelineOrchestrator};
