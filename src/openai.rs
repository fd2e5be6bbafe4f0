//! OpenAI chat-completions client.
//!
//! Two operations: a text completion constrained to a JSON object (used by
//! the tarot classifier) and an audio completion that submits a base64 WAV
//! to an audio-capable model.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct Client {
    api_key: String,
    text_model: String,
    audio_model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_completion_tokens: u32,
    messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modalities: Option<Vec<&'static str>>,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api(String),
    Parse(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

impl Client {
    pub fn new(
        api_key: String,
        text_model: String,
        audio_model: String,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self { api_key, text_model, audio_model, http }
    }

    /// Text completion returning the raw assistant reply. The response is
    /// constrained to a JSON object; parsing is the caller's concern.
    pub async fn chat_json(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, Error> {
        let request = ApiRequest {
            model: self.text_model.clone(),
            max_completion_tokens: max_tokens,
            messages: vec![
                json!({ "role": "system", "content": system }),
                json!({ "role": "user", "content": user }),
            ],
            response_format: Some(json!({ "type": "json_object" })),
            modalities: None,
        };

        self.send(request).await
    }

    /// Audio completion: submits a base64-encoded WAV as an `input_audio`
    /// content part alongside optional user text context.
    pub async fn chat_audio(
        &self,
        system: &str,
        wav_base64: &str,
        context: &str,
        max_tokens: u32,
    ) -> Result<String, Error> {
        let mut parts = vec![json!({
            "type": "input_audio",
            "input_audio": { "data": wav_base64, "format": "wav" }
        })];
        if !context.is_empty() {
            parts.push(json!({ "type": "text", "text": context }));
        }

        let request = ApiRequest {
            model: self.audio_model.clone(),
            max_completion_tokens: max_tokens,
            messages: vec![
                json!({ "role": "system", "content": system }),
                json!({ "role": "user", "content": parts }),
            ],
            response_format: None,
            modalities: Some(vec!["text"]),
        };

        self.send(request).await
    }

    async fn send(&self, request: ApiRequest) -> Result<String, Error> {
        let response = self
            .http
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        api_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|s| !s.trim().is_empty())
            .ok_or(Error::Empty)
    }
}
