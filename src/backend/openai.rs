use std::{env, time::Duration};

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible `/chat/completions` adapter.
#[derive(Clone)]
pub struct OpenAiAdapter {
    id: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(
        id: impl Into<String>,
        base_url: Option<&str>,
        api_key: impl Into<String>,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build OpenAI HTTP client: {error}"))?;

        Ok(Self {
            id: id.into(),
            client,
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_owned(),
            model: model.unwrap_or(DEFAULT_MODEL).to_owned(),
        })
    }

    pub fn from_env() -> Result<Option<Self>, String> {
        let Some(api_key) = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        let base_url = env::var("OPENAI_BASE_URL").ok();
        let model = env::var("OPENAI_MODEL").ok();
        let timeout_secs = env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60);

        Self::new(
            "openai",
            base_url.as_deref(),
            api_key,
            model.as_deref(),
            Duration::from_secs(timeout_secs),
        )
        .map(Some)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl InferenceBackend for OpenAiAdapter {
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
            "temperature": 0.2,
            "stream": false
        });

        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(map_http_error(
                response.status(),
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown backend error".to_owned()),
            ));
        }

        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|error| BackendError::MalformedResponse(error.to_string()))?;

        let reply = parse_reply(parsed)?;
        debug!(
            backend = %self.id,
            model = reply.metadata.model.as_deref().unwrap_or_default(),
            completion_tokens = reply.metadata.completion_tokens.unwrap_or_default(),
            "chat completion received"
        );
        Ok(reply)
    }
}

fn parse_reply(parsed: OpenAiChatResponse) -> Result<BackendReply, BackendError> {
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        BackendError::MalformedResponse("missing choices in response".to_owned())
    })?;
    let text = choice
        .message
        .content
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| BackendError::MalformedResponse("empty message content".to_owned()))?;

    Ok(BackendReply {
        text,
        metadata: ReplyMetadata {
            model: parsed.model,
            prompt_tokens: parsed.usage.as_ref().map(|usage| usage.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().map(|usage| usage.completion_tokens),
        },
    })
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
