//! Image-to-speech pipeline
//! Every received image becomes one request: describe, synthesize, send the audio back.
//! Service calls run on spawned tasks and report back through the engine's queue.
//! One background lease covers all outstanding requests.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::lease::{BackgroundExecution, BackgroundLease};
use super::services::{ImageDescriber, ServiceError, SpeechSynthesizer, speech_from_image};
use crate::config::pipeline_config::ConcurrencyPolicy;
use crate::core::events::{Event, EventSender, post};
use crate::core::transport::{FrameSubmitter, TransportError};

pub type RequestId = u64;

/// Identifies one acquisition of the shared background lease.
pub type LeaseGeneration = u64;

/// Completions posted back to the engine by pipeline tasks.
#[derive(Debug)]
pub enum PipelineEvent {
    AudioReady {
        request: RequestId,
        result: Result<Vec<u8>, ServiceError>,
    },
    SendFinished {
        request: RequestId,
        result: Result<(), TransportError>,
    },
    LeaseRevoked {
        lease: LeaseGeneration,
    },
}

/// Most recent pipeline outcome, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    None,
    ImageReceived { bytes: usize },
    AudioSent { bytes: usize },
    Failed(String),
}

struct Request {
    lease: LeaseGeneration,
    revoked: bool,
    audio_len: usize,
}

struct SharedLease {
    generation: LeaseGeneration,
    lease: BackgroundLease,
}

pub struct PipelineOrchestrator {
    describer: Arc<dyn ImageDescriber>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    background: Arc<dyn BackgroundExecution>,
    events: EventSender,
    policy: ConcurrencyPolicy,
    next_request: RequestId,
    requests: HashMap<RequestId, Request>,
    lease: Option<SharedLease>,
    lease_generation: LeaseGeneration,
    indication: watch::Sender<Indication>,
}

impl PipelineOrchestrator {
    pub fn new(
        describer: Arc<dyn ImageDescriber>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        background: Arc<dyn BackgroundExecution>,
        policy: ConcurrencyPolicy,
        events: EventSender,
    ) -> Self {
        let (indication, _) = watch::channel(Indication::None);
        Self {
            describer,
            synthesizer,
            background,
            events,
            policy,
            next_request: 0,
            requests: HashMap::new(),
            lease: None,
            lease_generation: 0,
            indication,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Indication> {
        self.indication.subscribe()
    }

    /// Requests whose lease or send is still outstanding.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Whether the shared background lease is currently held.
    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    fn indicate(&self, indication: Indication) {
        self.indication.send_replace(indication);
    }

    /// Returns the generation of the held lease, acquiring one if none is held.
    fn ensure_lease(&mut self) -> LeaseGeneration {
        if let Some(shared) = &self.lease {
            return shared.generation;
        }
        self.lease_generation += 1;
        let generation = self.lease_generation;
        let events = self.events.clone();
        let lease = BackgroundLease::acquire(
            self.background.clone(),
            "Image Processing",
            Box::new(move || post(&events, Event::Pipeline(PipelineEvent::LeaseRevoked { lease: generation }))),
        );
        self.lease = Some(SharedLease { generation, lease });
        generation
    }

    /// Drops a request and gives the lease back once nothing live relies on it.
    fn finish(&mut self, request: RequestId) -> Option<Request> {
        let entry = self.requests.remove(&request);
        if self.requests.values().all(|r| r.revoked) {
            if let Some(mut shared) = self.lease.take() {
                shared.lease.release();
            }
        }
        entry
    }

    /// A complete image arrived from the glasses.
    pub fn on_frame(&mut self, image: Vec<u8>) {
        if image.is_empty() {
            info!("Received zero length frame, ignoring");
            return;
        }
        if self.policy == ConcurrencyPolicy::DropWhileBusy && !self.requests.is_empty() {
            warn!(
                "Dropping {} byte image, {} request(s) still in flight",
                image.len(),
                self.requests.len()
            );
            return;
        }

        self.next_request += 1;
        let request = self.next_request;
        info!("Received image of {} bytes, starting request #{}", image.len(), request);
        self.indicate(Indication::ImageReceived { bytes: image.len() });

        let lease = self.ensure_lease();
        self.requests.insert(
            request,
            Request {
                lease,
                revoked: false,
                audio_len: 0,
            },
        );

        let describer = self.describer.clone();
        let synthesizer = self.synthesizer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = speech_from_image(describer.as_ref(), synthesizer.as_ref(), &image).await;
            post(&events, Event::Pipeline(PipelineEvent::AudioReady { request, result }));
        });
    }

    pub fn on_audio_ready(
        &mut self,
        request: RequestId,
        result: Result<Vec<u8>, ServiceError>,
        session: &mut dyn FrameSubmitter,
    ) {
        let Some(entry) = self.requests.get_mut(&request) else {
            debug!("Result for unknown request #{}", request);
            return;
        };
        if entry.revoked {
            info!("Discarding result of request #{}, its background time ran out", request);
            self.finish(request);
            return;
        }

        let audio = match result {
            Ok(audio) => {
                entry.audio_len = audio.len();
                audio
            }
            Err(e) => {
                error!("Request #{} failed: {}", request, e);
                self.finish(request);
                self.indicate(Indication::Failed(e.to_string()));
                return;
            }
        };

        let events = self.events.clone();
        let completion = Box::new(move |result: Result<(), TransportError>| {
            post(&events, Event::Pipeline(PipelineEvent::SendFinished { request, result }));
        });
        match session.submit_frame(&audio, completion) {
            Ok(()) => info!("Sending {} bytes of audio for request #{}", audio.len(), request),
            Err(e) => {
                error!("Could not send audio for request #{}: {}", request, e);
                self.finish(request);
                self.indicate(Indication::Failed(e.to_string()));
            }
        }
    }

    pub fn on_send_finished(&mut self, request: RequestId, result: Result<(), TransportError>) {
        let Some(entry) = self.finish(request) else {
            debug!("Send finished for unknown request #{}", request);
            return;
        };
        match result {
            Ok(()) => {
                info!("Audio for request #{} sent", request);
                self.indicate(Indication::AudioSent {
                    bytes: entry.audio_len,
                });
            }
            Err(e) => {
                error!("Sending audio for request #{} failed: {}", request, e);
                self.indicate(Indication::Failed(e.to_string()));
            }
        }
    }

    /// The host is taking the background time back. Work continues, results of
    /// the requests it covered are dropped.
    pub fn on_lease_revoked(&mut self, lease: LeaseGeneration) {
        match self.lease.take() {
            Some(mut shared) if shared.generation == lease => {
                shared.lease.release();
            }
            other => {
                self.lease = other;
                debug!("Revocation of stale lease {}", lease);
                return;
            }
        }
        let mut revoked = 0;
        for entry in self.requests.values_mut().filter(|r| r.lease == lease) {
            entry.revoked = true;
            revoked += 1;
        }
        warn!("Background time expired, {} request(s) will be discarded", revoked);
    }
}
