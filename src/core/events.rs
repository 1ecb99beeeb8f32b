//! The single event type flowing through the engine's queue.

use tokio::sync::mpsc;

use crate::commands::AppCommand;
use crate::core::bluetooth::RadioEvent;
use crate::core::pipeline::PipelineEvent;
use crate::core::transport::StreamEvent;

#[derive(Debug)]
pub enum Event {
    Radio(RadioEvent),
    Stream(StreamEvent),
    Command(AppCommand),
    /// Fired by the scan timer; stale attempts are ignored.
    ScanTimeout { attempt: u64 },
    Pipeline(PipelineEvent),
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Posts `event`, ignoring a queue whose engine has already stopped.
pub fn post(events: &EventSender, event: Event) {
    if events.send(event).is_err() {
        log::debug!("Engine stopped, dropping event");
    }
}
