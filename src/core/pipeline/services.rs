//! External services turning an image into speech.

use async_trait::async_trait;
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not parse service response: {0}")]
    Malformed(String),

    #[error("service returned an empty description")]
    EmptyDescription,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ImageDescriber: Send + Sync {
    /// Describes a JPEG image in free text.
    async fn describe(&self, image: &[u8]) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns encoded audio for `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Describes `image`, then speaks the description. Stops at the first failure.
pub async fn speech_from_image(
    describer: &dyn ImageDescriber,
    synthesizer: &dyn SpeechSynthesizer,
    image: &[u8],
) -> Result<Vec<u8>, ServiceError> {
    let description = describer.describe(image).await?;
    info!("Description: {}", description);
    let audio = synthesizer.synthesize(&description).await?;
    info!("Synthesized {} bytes of audio", audio.len());
    Ok(audio)
}
