//! Channel session: one opened logical channel and the frames moving over it

use log::{debug, error, info, warn};

use super::framer::{InboundAssembly, OutboundAssembly, SendCompletion, write_count};
use super::types::{
    ChannelId, ChannelStreams, SendError, StreamDirection, StreamEvent, StreamEventKind, TransportError,
};

/// The session's send entry point, as seen by the pipeline.
pub trait FrameSubmitter {
    /// Queues `payload` as the single outbound frame.
    ///
    /// On `Ok` the completion is guaranteed to run exactly once; on `Err` it is dropped
    /// without being called.
    fn submit_frame(&mut self, payload: &[u8], completion: SendCompletion) -> Result<(), SendError>;
}

/// What the owner must do after a stream event.
#[derive(Debug)]
pub enum SessionOutcome {
    Nothing,
    /// Both streams reported open; the channel is usable.
    Opened,
    /// One or more inbound frames completed.
    Frames(Vec<Vec<u8>>),
    /// The session is dead and must be torn down.
    Terminated(TransportError),
}

pub struct ChannelSession {
    streams: ChannelStreams,
    mtu: usize,
    writable: bool,
    inbound_open: bool,
    outbound_open: bool,
    inbound: InboundAssembly,
    outbound: Option<OutboundAssembly>,
}

impl ChannelSession {
    /// Wraps freshly opened streams. The session is not usable until both
    /// streams report `OpenCompleted`.
    pub fn open(streams: ChannelStreams, mtu: usize, max_frame_len: u32) -> Self {
        info!("Streams created for channel {} (MTU {})", streams.channel, mtu);
        Self {
            streams,
            mtu: mtu.max(1),
            writable: false,
            inbound_open: false,
            outbound_open: false,
            inbound: InboundAssembly::new(max_frame_len),
            outbound: None,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.streams.channel
    }

    pub fn is_open(&self) -> bool {
        self.inbound_open && self.outbound_open
    }

    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn inbound(&self) -> &InboundAssembly {
        &self.inbound
    }

    /// Applies one notification. Events raised by another channel are ignored.
    pub fn handle_event(&mut self, event: StreamEvent) -> SessionOutcome {
        if event.channel != self.streams.channel {
            debug!(
                "Dropping {:?} from channel {}, session is on channel {}",
                event.kind, event.channel, self.streams.channel
            );
            return SessionOutcome::Nothing;
        }
        match event.kind {
            StreamEventKind::OpenCompleted => {
                info!("{} stream opened", event.direction);
                let was_open = self.is_open();
                match event.direction {
                    StreamDirection::Inbound => self.inbound_open = true,
                    StreamDirection::Outbound => self.outbound_open = true,
                }
                if !was_open && self.is_open() {
                    SessionOutcome::Opened
                } else {
                    SessionOutcome::Nothing
                }
            }
            StreamEventKind::HasBytesAvailable => {
                if event.direction != StreamDirection::Inbound {
                    return SessionOutcome::Nothing;
                }
                match self.on_readable() {
                    Ok(frames) if frames.is_empty() => SessionOutcome::Nothing,
                    Ok(frames) => SessionOutcome::Frames(frames),
                    Err(e) => SessionOutcome::Terminated(e),
                }
            }
            StreamEventKind::HasSpaceAvailable => {
                if event.direction == StreamDirection::Outbound {
                    debug!("Output stream has space available");
                    self.on_writable();
                }
                SessionOutcome::Nothing
            }
            StreamEventKind::ErrorOccurred(reason) => {
                SessionOutcome::Terminated(TransportError::Stream(reason))
            }
            StreamEventKind::EndEncountered => SessionOutcome::Terminated(TransportError::EndOfStream),
        }
    }

    /// Reads everything buffered on the inbound stream.
    pub fn on_readable(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        let frames = self.inbound.drain(self.streams.inbound.as_mut(), self.mtu)?;
        for frame in &frames {
            info!("Received complete frame of {} bytes", frame.len());
        }
        Ok(frames)
    }

    /// The outbound stream has room again.
    pub fn on_writable(&mut self) {
        self.writable = true;
        self.pump();
    }

    pub fn submit(&mut self, payload: &[u8], completion: SendCompletion) -> Result<(), SendError> {
        if self.outbound.is_some() {
            warn!("Rejecting {} byte frame, another frame is in flight", payload.len());
            return Err(SendError::InFlight);
        }

        let assembly = OutboundAssembly::new(payload, completion)?;
        info!(
            "Prepared frame for sending: {} bytes in about {} writes",
            assembly.total_len(),
            write_count(payload.len(), self.mtu)
        );
        self.outbound = Some(assembly);
        self.pump();
        Ok(())
    }

    fn pump(&mut self) {
        let Some(assembly) = self.outbound.as_mut() else {
            return;
        };

        match assembly.pump(self.streams.outbound.as_mut(), self.mtu, &mut self.writable) {
            Ok(false) => {}
            Ok(true) => {
                if let Some(done) = self.outbound.take() {
                    info!("Frame of {} bytes sent", done.total_len());
                    done.finish(Ok(()));
                }
            }
            Err(e) => {
                error!("Error sending frame: {}", e);
                if let Some(failed) = self.outbound.take() {
                    failed.finish(Err(e));
                }
            }
        }
    }

    /// Closes both streams, failing any frame still in flight.
    pub fn close(mut self) {
        info!("Streams closed");
        self.streams.close();
        self.inbound.reset();
        if let Some(pending) = self.outbound.take() {
            pending.finish(Err(TransportError::SessionClosed));
        }
    }
}

impl FrameSubmitter for ChannelSession {
    fn submit_frame(&mut self, payload: &[u8], completion: SendCompletion) -> Result<(), SendError> {
        self.submit(payload, completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{RecordingSink, ScriptedSource};
    use crate::core::transport::framer::encode_frame;
    use std::sync::{Arc, Mutex};

    type Results = Arc<Mutex<Vec<Result<(), String>>>>;

    const CHANNEL: ChannelId = 7;

    fn event(direction: StreamDirection, kind: StreamEventKind) -> StreamEvent {
        StreamEvent::new(CHANNEL, direction, kind)
    }

    fn completion(results: &Results) -> SendCompletion {
        let results = results.clone();
        Box::new(move |result| {
            results
                .lock()
                .unwrap()
                .push(result.map_err(|e| e.to_string()));
        })
    }

    fn session_with(source: ScriptedSource, sink: RecordingSink, mtu: usize) -> ChannelSession {
        let streams = ChannelStreams::new(CHANNEL, Box::new(source), Box::new(sink));
        let mut session = ChannelSession::open(streams, mtu, 1 << 20);
        for direction in [StreamDirection::Inbound, StreamDirection::Outbound] {
            session.handle_event(event(direction, StreamEventKind::OpenCompleted));
        }
        session
    }

    #[test]
    fn open_is_reported_once_both_streams_complete() {
        let streams = ChannelStreams::new(
            CHANNEL,
            Box::new(ScriptedSource::default()),
            Box::new(RecordingSink::default()),
        );
        let mut session = ChannelSession::open(streams, 64, 1024);
        let first = session.handle_event(event(
            StreamDirection::Outbound,
            StreamEventKind::OpenCompleted,
        ));
        assert!(matches!(first, SessionOutcome::Nothing));
        assert!(!session.is_open());

        let second = session.handle_event(event(
            StreamDirection::Inbound,
            StreamEventKind::OpenCompleted,
        ));
        assert!(matches!(second, SessionOutcome::Opened));
        assert!(session.is_open());
    }

    #[test]
    fn readable_event_delivers_frames() {
        let source = ScriptedSource::default();
        let feeder = source.clone();
        let mut session = session_with(source, RecordingSink::default(), 1251);

        feeder.push(&encode_frame(b"jpeg bytes").unwrap());
        let outcome = session.handle_event(event(
            StreamDirection::Inbound,
            StreamEventKind::HasBytesAvailable,
        ));
        match outcome {
            SessionOutcome::Frames(frames) => assert_eq!(frames, vec![b"jpeg bytes".to_vec()]),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn second_submission_is_rejected_and_first_still_completes() {
        let sink = RecordingSink::with_limits(vec![0]);
        let written = sink.clone();
        let mut session = session_with(ScriptedSource::default(), sink, 512);
        let results: Results = Arc::default();
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();

        session.on_writable();
        session.submit(&payload, completion(&results)).unwrap();
        assert!(!session.is_writable());
        assert!(session.is_sending());

        let rejected = session.submit(b"second", completion(&results));
        assert_eq!(rejected, Err(SendError::InFlight));

        session.handle_event(event(
            StreamDirection::Outbound,
            StreamEventKind::HasSpaceAvailable,
        ));
        assert!(!session.is_sending());
        assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
        assert_eq!(written.bytes(), encode_frame(&payload).unwrap());
        assert_eq!(written.write_sizes(), vec![0, 512, 512, 512, 468]);
    }

    #[test]
    fn submission_waits_for_first_writable_edge() {
        let sink = RecordingSink::default();
        let written = sink.clone();
        let mut session = session_with(ScriptedSource::default(), sink, 512);
        let results: Results = Arc::default();

        session.submit(b"audio", completion(&results)).unwrap();
        assert!(written.write_sizes().is_empty());

        session.on_writable();
        assert_eq!(written.write_sizes(), vec![9]);
        assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn write_error_fails_the_frame_and_frees_the_slot() {
        let sink = RecordingSink::failing();
        let mut session = session_with(ScriptedSource::default(), sink, 512);
        let results: Results = Arc::default();

        session.on_writable();
        session.submit(b"audio", completion(&results)).unwrap();
        assert!(!session.is_sending());
        let recorded = results.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].as_ref().unwrap_err().contains("write"));
    }

    #[test]
    fn terminal_events_end_the_session() {
        let mut session = session_with(ScriptedSource::default(), RecordingSink::default(), 512);
        let outcome = session.handle_event(event(
            StreamDirection::Inbound,
            StreamEventKind::EndEncountered,
        ));
        assert!(matches!(outcome, SessionOutcome::Terminated(TransportError::EndOfStream)));

        let outcome = session.handle_event(event(
            StreamDirection::Outbound,
            StreamEventKind::ErrorOccurred("link lost".into()),
        ));
        assert!(matches!(outcome, SessionOutcome::Terminated(TransportError::Stream(_))));
    }

    #[test]
    fn events_from_another_channel_are_ignored() {
        let source = ScriptedSource::default();
        let feeder = source.clone();
        let mut session = session_with(source, RecordingSink::default(), 512);
        feeder.push(&encode_frame(b"jpeg").unwrap());

        for kind in [
            StreamEventKind::EndEncountered,
            StreamEventKind::ErrorOccurred("old link".into()),
            StreamEventKind::HasBytesAvailable,
        ] {
            let outcome = session.handle_event(StreamEvent::new(CHANNEL - 1, StreamDirection::Inbound, kind));
            assert!(matches!(outcome, SessionOutcome::Nothing));
        }
        assert_eq!(session.channel(), CHANNEL);

        let outcome = session.handle_event(event(StreamDirection::Inbound, StreamEventKind::HasBytesAvailable));
        assert!(matches!(outcome, SessionOutcome::Frames(frames) if frames == vec![b"jpeg".to_vec()]));
    }

    #[test]
    fn closing_fails_the_in_flight_frame() {
        let sink = RecordingSink::default();
        let closed = sink.clone();
        let mut session = session_with(ScriptedSource::default(), sink, 512);
        let results: Results = Arc::default();

        session.submit(b"never written", completion(&results)).unwrap();
        session.close();

        assert!(closed.is_closed());
        assert_eq!(
            *results.lock().unwrap(),
            vec![Err(TransportError::SessionClosed.to_string())]
        );
    }
}
