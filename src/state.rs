//! Application state management
//! Handles to the running engine: the command queue and the observable state.

use anyhow::{Result, anyhow};
use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::commands::AppCommand;
use crate::core::bluetooth::{ConnectionManager, ConnectionState, Radio};
use crate::core::engine::Engine;
use crate::core::events::{Event, EventReceiver, EventSender};
use crate::core::pipeline::{Indication, PipelineOrchestrator};

/// Global application state
pub struct AppState {
    events: EventSender,
    connection: watch::Receiver<ConnectionState>,
    indication: watch::Receiver<Indication>,
    engine: JoinHandle<()>,
}

impl AppState {
    /// Starts the engine task on the queue `events`/`queue`.
    pub fn spawn<R: Radio + 'static>(
        connection: ConnectionManager<R>,
        pipeline: PipelineOrchestrator,
        events: EventSender,
        queue: EventReceiver,
    ) -> Self {
        let connection_rx = connection.subscribe();
        let indication_rx = pipeline.subscribe();
        info!("Starting engine task");
        let engine = tokio::spawn(Engine::new(connection, pipeline).run(queue));
        Self {
            events,
            connection: connection_rx,
            indication: indication_rx,
            engine,
        }
    }

    pub fn send(&self, command: AppCommand) -> Result<()> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| anyhow!("Engine is not running"))
    }

    pub fn connect(&self) -> Result<()> {
        self.send(AppCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(AppCommand::Disconnect)
    }

    pub fn state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn indication(&self) -> Indication {
        self.indication.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn watch_indication(&self) -> watch::Receiver<Indication> {
        self.indication.clone()
    }

    /// Stops the engine and waits for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        if self.send(AppCommand::Shutdown).is_err() {
            info!("Engine already stopped");
        }
        self.engine.await.map_err(|e| {
            error!("Engine task failed: {}", e);
            anyhow!("Engine task failed: {}", e)
        })
    }
}
