//! The engine task: the one place every event is handled.

use std::ops::ControlFlow;

use log::{info, warn};

use crate::commands::AppCommand;
use crate::core::bluetooth::{ConnectionManager, Radio};
use crate::core::events::{Event, EventReceiver};
use crate::core::pipeline::{PipelineEvent, PipelineOrchestrator};

pub struct Engine<R: Radio> {
    connection: ConnectionManager<R>,
    pipeline: PipelineOrchestrator,
}

impl<R: Radio> Engine<R> {
    pub fn new(connection: ConnectionManager<R>, pipeline: PipelineOrchestrator) -> Self {
        Self {
            connection,
            pipeline,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<R> {
        &self.connection
    }

    pub fn pipeline(&self) -> &PipelineOrchestrator {
        &self.pipeline
    }

    /// Handles one event. `Break` means the engine was asked to stop.
    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Radio(event) => self.connection.handle_radio_event(event),
            Event::Stream(event) => {
                for frame in self.connection.handle_stream_event(event) {
                    self.pipeline.on_frame(frame);
                }
            }
            Event::ScanTimeout { attempt } => self.connection.on_scan_timeout(attempt),
            Event::Pipeline(PipelineEvent::AudioReady { request, result }) => {
                self.pipeline.on_audio_ready(request, result, &mut self.connection)
            }
            Event::Pipeline(PipelineEvent::SendFinished { request, result }) => {
                self.pipeline.on_send_finished(request, result)
            }
            Event::Pipeline(PipelineEvent::LeaseRevoked { lease }) => {
                self.pipeline.on_lease_revoked(lease)
            }
            Event::Command(AppCommand::Connect) => {
                if let Err(e) = self.connection.connect() {
                    warn!("Connect request ignored: {}", e);
                }
            }
            Event::Command(AppCommand::Disconnect) => self.connection.disconnect(),
            Event::Command(AppCommand::Shutdown) => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub async fn run(mut self, mut events: EventReceiver) {
        info!("Engine started");
        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::config::pipeline_config::ConcurrencyPolicy;
    use crate::core::bluetooth::{
        ConnectionState, LinkState, MemoryIdentityStore, PeripheralId, RadioEvent, RadioPower,
    };
    use crate::core::pipeline::Indication;
    use crate::core::test_support::{
        ChannelEnds, FakeRadio, RecordingBackground, StubDescriber, StubSynthesizer, open_streams,
    };
    use crate::core::transport::{StreamDirection, StreamEventKind, encode_frame};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn stream(ends: &ChannelEnds, direction: StreamDirection, kind: StreamEventKind) -> Event {
        Event::Stream(ends.event(direction, kind))
    }

    #[tokio::test]
    async fn image_in_audio_out() {
        let config = AppConfig::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let radio = FakeRadio::default();
        let background = RecordingBackground::default();
        let connection = ConnectionManager::new(
            radio.clone(),
            Box::new(MemoryIdentityStore::default()),
            config.radio.clone(),
            tx.clone(),
        );
        let pipeline = PipelineOrchestrator::new(
            Arc::new(StubDescriber::answering("Stairs ahead.")),
            Arc::new(StubSynthesizer::default()),
            Arc::new(background.clone()),
            ConcurrencyPolicy::Concurrent,
            tx.clone(),
        );
        let mut engine = Engine::new(connection, pipeline);
        let state = engine.connection().subscribe();
        let indication = engine.pipeline().subscribe();
        let glasses = PeripheralId::new("glasses");

        radio.set_power(RadioPower::PoweredOn);
        let _ = engine.handle(Event::Radio(RadioEvent::PowerChanged(RadioPower::PoweredOn)));
        let _ = engine.handle(Event::Command(AppCommand::Connect));
        let _ = engine.handle(Event::Radio(RadioEvent::Discovered {
            peripheral: glasses.clone(),
            name: Some("Glimpse".into()),
            rssi: Some(-40),
        }));
        radio.set_link(&glasses, LinkState::Connected);
        let _ = engine.handle(Event::Radio(RadioEvent::Connected(glasses.clone())));
        let (streams, ends) = open_streams();
        let _ = engine.handle(Event::Radio(RadioEvent::ChannelOpened {
            peripheral: glasses,
            result: Ok(streams),
        }));
        let _ = engine.handle(stream(&ends, StreamDirection::Inbound, StreamEventKind::OpenCompleted));
        let _ = engine.handle(stream(&ends, StreamDirection::Outbound, StreamEventKind::OpenCompleted));
        let _ = engine.handle(stream(&ends, StreamDirection::Outbound, StreamEventKind::HasSpaceAvailable));
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        ends.feed(&encode_frame(&[0xD8; 2000]).unwrap());
        let _ = engine.handle(stream(&ends, StreamDirection::Inbound, StreamEventKind::HasBytesAvailable));
        assert_eq!(*indication.borrow(), Indication::ImageReceived { bytes: 2000 });

        while engine.pipeline().in_flight() > 0 {
            let event = rx.recv().await.unwrap();
            if matches!(event, Event::ScanTimeout { .. }) {
                continue;
            }
            let _ = engine.handle(event);
        }

        assert_eq!(ends.sent(), encode_frame(b"AUDIO:Stairs ahead.").unwrap());
        assert_eq!(*indication.borrow(), Indication::AudioSent { bytes: 19 });
        assert_eq!(background.begun(), background.ended());
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            FakeRadio::default(),
            Box::new(MemoryIdentityStore::default()),
            AppConfig::default().radio,
            tx.clone(),
        );
        let pipeline = PipelineOrchestrator::new(
            Arc::new(StubDescriber::answering("unused")),
            Arc::new(StubSynthesizer::default()),
            Arc::new(RecordingBackground::default()),
            ConcurrencyPolicy::Concurrent,
            tx.clone(),
        );
        let engine = Engine::new(connection, pipeline);
        let task = tokio::spawn(engine.run(rx));

        tx.send(Event::Command(AppCommand::Disconnect)).unwrap();
        tx.send(Event::Command(AppCommand::Shutdown)).unwrap();
        task.await.unwrap();
    }
}
