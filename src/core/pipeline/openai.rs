//! OpenAI-backed image description and speech synthesis

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use super::services::{ImageDescriber, ServiceError, SpeechSynthesizer};
use crate::config::service_config::ServiceConfig;

#[derive(Serialize)]
struct VisionRequest<'a> {
    model: &'a str,
    input: [VisionMessage<'a>; 1],
}

#[derive(Serialize)]
struct VisionMessage<'a> {
    role: &'static str,
    content: [VisionContent<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VisionContent<'a> {
    InputText { text: &'a str },
    InputImage { image_url: String, detail: &'a str },
}

#[derive(Deserialize)]
struct VisionResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    instructions: &'a str,
    response_format: &'a str,
}

/// Client for the `/responses` and `/audio/speech` endpoints
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    config: ServiceConfig,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, config: ServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn vision_body(&self, image: &[u8]) -> serde_json::Result<Vec<u8>> {
        let request = VisionRequest {
            model: &self.config.vision_model,
            input: [VisionMessage {
                role: "user",
                content: [
                    VisionContent::InputText {
                        text: &self.config.vision_prompt,
                    },
                    VisionContent::InputImage {
                        image_url: format!("data:image/jpeg;base64,{}", BASE64.encode(image)),
                        detail: &self.config.image_detail,
                    },
                ],
            }],
        };
        serde_json::to_vec(&request)
    }

    fn speech_request<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.config.tts_model,
            input: text,
            voice: &self.config.tts_voice,
            instructions: &self.config.tts_instructions,
            response_format: &self.config.tts_response_format,
        }
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<reqwest::Response, ServiceError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("{} returned {}: {}", path, status, body);
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Pulls the first `output_text` of the first `message` item out of a responses body.
pub fn extract_description(body: &[u8]) -> Result<String, ServiceError> {
    let response: VisionResponse =
        serde_json::from_slice(body).map_err(|e| ServiceError::Malformed(e.to_string()))?;

    let text = response
        .output
        .into_iter()
        .find(|item| item.kind == "message")
        .and_then(|message| message.content.into_iter().find(|c| c.kind == "output_text"))
        .and_then(|content| content.text)
        .ok_or_else(|| ServiceError::Malformed("no output_text in response".to_string()))?;

    if text.trim().is_empty() {
        return Err(ServiceError::EmptyDescription);
    }
    Ok(text)
}

#[async_trait]
impl ImageDescriber for OpenAiClient {
    async fn describe(&self, image: &[u8]) -> Result<String, ServiceError> {
        info!("Requesting description of {} byte image", image.len());
        let body = self
            .vision_body(image)
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        let response = self.post("responses", body).await?;
        let bytes = response.bytes().await?;
        debug!("Vision response: {} bytes", bytes.len());
        extract_description(&bytes)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError> {
        info!("Requesting speech for {} characters", text.len());
        let body = serde_json::to_vec(&self.speech_request(text))
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        let response = self.post("audio/speech", body).await?;
        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn client(api_base: &str) -> OpenAiClient {
        let config = ServiceConfig {
            api_base: api_base.to_string(),
            ..ServiceConfig::default()
        };
        OpenAiClient::new("sk-test", config).unwrap()
    }

    /// Serves one canned HTTP response and hands back the raw request it answered.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= split + 4 + length
    }

    fn request_json(raw: &str) -> Value {
        let (_, body) = raw.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn vision_body_inlines_the_image() {
        let client = client("http://localhost");
        let body: Value = serde_json::from_slice(&client.vision_body(b"\xFF\xD8").unwrap()).unwrap();

        assert_eq!(body["model"], "o4-mini");
        let message = &body["input"][0];
        assert_eq!(message["role"], "user");
        assert_eq!(message["content"][0]["type"], "input_text");
        assert_eq!(message["content"][1]["type"], "input_image");
        assert_eq!(message["content"][1]["image_url"], "data:image/jpeg;base64,/9g=");
        assert_eq!(message["content"][1]["detail"], "auto");
    }

    #[test]
    fn speech_request_uses_configured_voice() {
        let client = client("http://localhost");
        let body = serde_json::to_value(client.speech_request("hello")).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o-mini-tts",
                "input": "hello",
                "voice": "alloy",
                "instructions": "Speak quickly, calmly, and clearly.",
                "response_format": "mp3",
            })
        );
    }

    #[test]
    fn description_comes_from_the_first_message() {
        let body = json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "A door is ahead of you." },
                    { "type": "output_text", "text": "ignored" }
                ]}
            ]
        });
        let text = extract_description(body.to_string().as_bytes()).unwrap();
        assert_eq!(text, "A door is ahead of you.");
    }

    #[test]
    fn missing_or_empty_text_is_an_error() {
        let no_message = json!({ "output": [{ "type": "reasoning" }] });
        assert!(matches!(
            extract_description(no_message.to_string().as_bytes()),
            Err(ServiceError::Malformed(_))
        ));

        let empty = json!({ "output": [{ "type": "message", "content": [{ "type": "output_text", "text": " " }] }] });
        assert!(matches!(
            extract_description(empty.to_string().as_bytes()),
            Err(ServiceError::EmptyDescription)
        ));

        assert!(matches!(extract_description(b"<html>"), Err(ServiceError::Malformed(_))));
    }

    #[tokio::test]
    async fn describe_posts_to_responses_with_bearer_auth() {
        let reply = json!({
            "output": [{ "type": "message", "content": [{ "type": "output_text", "text": "A staircase." }] }]
        });
        let (base, server) = serve_once("200 OK", reply.to_string().into_bytes()).await;

        let text = client(&base).describe(b"jpeg").await.unwrap();
        assert_eq!(text, "A staircase.");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /responses "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert_eq!(request_json(&raw)["model"], "o4-mini");
    }

    #[tokio::test]
    async fn synthesize_returns_raw_audio() {
        let (base, server) = serve_once("200 OK", b"ID3 mp3 bytes".to_vec()).await;

        let audio = client(&base).synthesize("A staircase.").await.unwrap();
        assert_eq!(audio, b"ID3 mp3 bytes".to_vec());

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /audio/speech "));
        assert_eq!(request_json(&raw)["input"], "A staircase.");
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (base, server) = serve_once("429 Too Many Requests", b"slow down".to_vec()).await;

        let err = client(&base).describe(b"jpeg").await.unwrap_err();
        match err {
            ServiceError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error {other:?}"),
        }
        server.await.unwrap();
    }
}
