//! Image-to-speech pipeline: background leases, external services and the orchestrator.

pub mod lease;
pub mod openai;
pub mod orchestrator;
pub mod services;

pub use lease::{BackgroundExecution, BackgroundLease, ExpirationHandler, LeaseToken, TimedBackground};
pub use openai::OpenAiClient;
pub use orchestrator::{Indication, PipelineEvent, PipelineOrchestrator, RequestId};
pub use services::{ImageDescriber, ServiceError, SpeechSynthesizer, speech_from_image};
