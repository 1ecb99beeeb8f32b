use serde::{Deserialize, Serialize};

const DEFAULT_VISION_PROMPT: &str = "You are seeing this for me. Concisely describe what is directly in front of me, and mention key objects to my left and right. Focus on object placement and distance. For example, 'A red mug is in front of you, slightly to your left. Your keys are to your right.' Be direct and brief.";

/// Settings for the image-description and speech-synthesis services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL both endpoints hang off (`/responses`, `/audio/speech`)
    pub api_base: String,
    pub vision_model: String,
    pub vision_prompt: String,
    /// Detail hint sent with the inline image (`low`, `high`, `auto`)
    pub image_detail: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_instructions: String,
    pub tts_response_format: String,
    /// Whole-request timeout applied to each service call
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            api_base: "https://api.openai.com/v1".to_string(),
            vision_model: "o4-mini".to_string(),
            vision_prompt: DEFAULT_VISION_PROMPT.to_string(),
            image_detail: "auto".to_string(),
            tts_model: "gpt-4o-mini-tts".to_string(),
            tts_voice: "alloy".to_string(),
            tts_instructions: "Speak quickly, calmly, and clearly.".to_string(),
            tts_response_format: "mp3".to_string(),
            request_timeout_secs: 60,
        }
    }
}
