use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{
        map_http_error, map_transport_error, system_prompt, BackendError, BackendReply,
        InferenceBackend, ReplyMetadata,
    },
    models::AssistRequest,
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3.1";

/// Local Ollama `/api/chat` adapter.
#[derive(Clone)]
pub struct OllamaAdapter {
    id: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaAdapter {
    pub fn new(
        id: impl Into<String>,
        base_url: Option<&str>,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build Ollama HTTP client: {error}"))?;

        Ok(Self {
            id: id.into(),
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_owned(),
            model: model.unwrap_or(DEFAULT_MODEL).to_owned(),
        })
    }
}

#[async_trait]
impl InferenceBackend for OllamaAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: &AssistRequest) -> Result<BackendReply, BackendError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt(request)},
                {"role": "user", "content": request.text()},
            ],
            "stream": false
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(
                response.status(),
                response.text().await.unwrap_or_default(),
            ));
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|error| BackendError::MalformedResponse(error.to_string()))?;

        let reply = parse_reply(parsed)?;
        debug!(backend = %self.id, model = %self.model, "ollama chat received");
        Ok(reply)
    }
}

fn parse_reply(parsed: OllamaChatResponse) -> Result<BackendReply, BackendError> {
    if let Some(error) = parsed.error {
        return Err(BackendError::Unavailable(error));
    }
    let text = parsed
        .message
        .map(|message| message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| BackendError::MalformedResponse("missing message content".to_owned()))?;

    Ok(BackendReply {
        text,
        metadata: ReplyMetadata {
            model: parsed.model,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
        },
    })
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}
