use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::http_client::build_http_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Plain text, or OpenAI-style multimodal parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user message carrying a caption and a JPEG image as a data URL.
    pub fn user_with_image(caption: &str, image_base64: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: caption.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/jpeg;base64,{}", image_base64),
                    },
                },
            ]),
        }
    }
}

/// Everything needed for one completion round-trip.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    /// The requested model does not exist on the provider. Never retried on
    /// the vision path.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("completion request timed out")]
    Timeout,
    #[error("completion failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;
}

#[async_trait]
pub trait TranscriptionApi: Send + Sync {
    /// Transcribe an audio clip (e.g. Ogg/Opus voice note) to text.
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// OpenAI-compatible chat completion and transcription client.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    transcription_model: String,
    transcription_language: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, client: reqwest::Client) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            transcription_model: "whisper-1".to_string(),
            transcription_language: None,
            client,
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let client = build_http_client(None, config.proxy_url.as_deref())
            .context("Failed to build LLM HTTP client")?;
        let mut llm = Self::new(config.llm_api_url.clone(), config.llm_api_key.clone(), client);
        llm.transcription_model = config.transcription_model.clone();
        llm.transcription_language = config.transcription_language.clone();
        Ok(llm)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // Local OpenAI-compatible servers usually run without a key.
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> CompletionError {
    if error.is_timeout() {
        CompletionError::Timeout
    } else {
        CompletionError::Transient(error.to_string())
    }
}

/// Map a non-success HTTP response to the retry taxonomy.
fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> CompletionError {
    let lowered = body.to_lowercase();
    if status == reqwest::StatusCode::NOT_FOUND
        || lowered.contains("does not exist")
        || lowered.contains("model not found")
        || lowered.contains("model_not_found")
    {
        return CompletionError::ModelUnavailable(format!("HTTP {}", status));
    }
    if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        return CompletionError::Timeout;
    }
    let snippet: String = body.chars().take(200).collect();
    CompletionError::Transient(format!("HTTP {}: {}", status, snippet))
}

#[async_trait]
impl CompletionApi for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let req = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body);
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(classify_http_failure(status, &body));
        }

        let completion: ChatCompletionResponse =
            response.json().await.map_err(classify_send_error)?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::Transient("No response from model".to_string()))
    }
}

#[async_trait]
impl TranscriptionApi for LlmClient {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String> {
        let url = format!("{}/audio/transcriptions", self.api_url);
        let file = reqwest::multipart::Part::bytes(audio)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .context("Invalid audio mime type")?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", file);
        if let Some(language) = &self.transcription_language {
            form = form.text("language", language.clone());
        }

        let response = self
            .authorize(self.client.post(&url).multipart(form))
            .send()
            .await
            .context("Failed to send transcription request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Transcription API returned error {}: {}", status, body);
        }

        let transcript: TranscriptionResponse = response
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(transcript.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn multimodal_message_serializes_in_openai_shape() {
        let message = Message::user_with_image("what is this", "QUJD");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,QUJD"}}
                ]
            })
        );
    }

    #[test]
    fn text_message_round_trips_as_plain_string() {
        let value = json!({"role": "assistant", "content": "hi there"});
        let message: Message = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, MessageContent::Text("hi there".to_string()));
        assert_eq!(serde_json::to_value(&message).unwrap(), value);
    }

    #[test]
    fn http_failures_map_to_retry_classes() {
        assert!(matches!(
            classify_http_failure(
                reqwest::StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"The model `gpt-vision-x` does not exist"}}"#
            ),
            CompletionError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_http_failure(reqwest::StatusCode::NOT_FOUND, ""),
            CompletionError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_http_failure(reqwest::StatusCode::GATEWAY_TIMEOUT, "upstream timed out"),
            CompletionError::Timeout
        ));
        assert!(matches!(
            classify_http_failure(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            CompletionError::Transient(_)
        ));
    }

    #[test]
    fn empty_api_key_is_treated_as_absent() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".to_string(),
            Some("  ".to_string()),
            reqwest::Client::new(),
        );
        assert!(client.api_key.is_none());
        assert_eq!(client.api_url, "http://localhost:11434/v1");
    }
}
