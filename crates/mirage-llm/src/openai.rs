//! OpenAI-compatible chat and image clients.
//!
//! Every supported provider exposes an OpenAI-shaped `/chat/completions`
//! endpoint, so one client covers them all; only the base URL differs.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use mirage_core::errors::{ImageGenError, ProviderError};
use mirage_core::history::{ImageGenProvider, ImageRatio, ReasoningTrace, UsageMetrics};
use mirage_core::provider::{
    ChatMessage, ChatRole, ImageBytes, ImageGenClient, ImageRequest, LlmClient, LlmResult,
    ModelProvider, ReasoningMode,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn default_base_url(provider: ModelProvider) -> &'static str {
    match provider {
        ModelProvider::Openai => "https://api.openai.com/v1",
        ModelProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        ModelProvider::Anthropic => "https://api.anthropic.com/v1",
        ModelProvider::Grok => "https://api.x.ai/v1",
        ModelProvider::Groq => "https://api.groq.com/openai/v1",
        ModelProvider::Openrouter => "https://openrouter.ai/api/v1",
    }
}

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub provider: ModelProvider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
    pub reasoning_mode: ReasoningMode,
    pub reasoning_tokens: Option<i64>,
    pub request_timeout: Option<Duration>,
}

fn build_http_client(timeout: Option<Duration>) -> Result<Client, ProviderError> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ProviderError::NetworkError(format!("failed to build HTTP client: {e}")))
}

fn map_transport_error(error: reqwest::Error, timeout: Option<Duration>) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout.unwrap_or_default())
    } else {
        ProviderError::NetworkError(error.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    match ProviderError::from_status(status.as_u16(), body) {
        ProviderError::RateLimited { .. } => Err(ProviderError::RateLimited { retry_after }),
        other => Err(other),
    }
}

pub struct OpenAiCompatClient {
    client: Client,
    settings: ClientSettings,
    endpoint: String,
}

impl OpenAiCompatClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ProviderError> {
        if settings.api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured);
        }
        let base = settings
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(settings.provider).to_string());
        Ok(Self {
            client: build_http_client(settings.request_timeout)?,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            settings,
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect();
        let mut body = json!({
            "model": self.settings.model,
            "messages": messages,
            "max_tokens": self.settings.max_output_tokens,
        });
        let effort = match self.settings.reasoning_mode {
            ReasoningMode::Low => Some("low"),
            ReasoningMode::Medium => Some("medium"),
            ReasoningMode::High | ReasoningMode::Xhigh => Some("high"),
            ReasoningMode::None | ReasoningMode::Default => None,
        };
        if let (Some(effort), Some(obj)) = (effort, body.as_object_mut()) {
            obj.insert("reasoning_effort".into(), json!(effort));
        }
        body
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Deserialize)]
struct CompletionDetails {
    reasoning_tokens: Option<u64>,
}

/// Message content is either a string or a list of typed parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider(&self) -> ModelProvider {
        self.settings.provider
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn max_output_tokens(&self) -> u32 {
        self.settings.max_output_tokens
    }

    fn reasoning_mode(&self) -> ReasoningMode {
        self.settings.reasoning_mode
    }

    fn reasoning_tokens(&self) -> Option<i64> {
        self.settings.reasoning_tokens
    }

    #[instrument(skip_all, fields(provider = %self.settings.provider, model = %self.settings.model, messages = messages.len()))]
    async fn generate(&self, messages: &[ChatMessage]) -> Result<LlmResult, ProviderError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.settings.request_timeout))?;
        let resp = check_status(resp).await?;
        let completion: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(ProviderError::MalformedResponse("response has no choices".into()));
        };
        let text = content_text(&choice.message.content);
        let reasoning = choice
            .message
            .reasoning_content
            .or(choice.message.reasoning)
            .filter(|r| !r.trim().is_empty())
            .map(|r| ReasoningTrace {
                summaries: vec![r],
                details: Vec::new(),
            });
        let usage = completion.usage.map(|u| UsageMetrics {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            reasoning_tokens: u.completion_tokens_details.and_then(|d| d.reasoning_tokens),
            total_tokens: u.total_tokens,
        });
        tracing::debug!(chars = text.len(), "completion received");
        Ok(LlmResult {
            html: text,
            usage,
            reasoning,
        })
    }
}

/// Image generation via an OpenAI-compatible `/images/generations` endpoint.
pub struct OpenAiImageClient {
    client: Client,
    provider: ImageGenProvider,
    endpoint: String,
}

impl OpenAiImageClient {
    pub fn new(provider: ImageGenProvider, base_url: Option<&str>) -> Result<Self, ImageGenError> {
        let base = base_url.map(str::to_string).unwrap_or_else(|| {
            match provider {
                ImageGenProvider::Openai => "https://api.openai.com/v1",
                ImageGenProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
                ImageGenProvider::Openrouter => "https://openrouter.ai/api/v1",
            }
            .to_string()
        });
        Ok(Self {
            client: build_http_client(None)?,
            provider,
            endpoint: format!("{}/images/generations", base.trim_end_matches('/')),
        })
    }
}

fn size_for(ratio: ImageRatio) -> &'static str {
    match ratio {
        ImageRatio::Square => "1024x1024",
        ImageRatio::Wide | ImageRatio::Landscape => "1536x1024",
        ImageRatio::Tall | ImageRatio::Portrait => "1024x1536",
    }
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

#[async_trait]
impl ImageGenClient for OpenAiImageClient {
    fn provider(&self) -> ImageGenProvider {
        self.provider
    }

    #[instrument(skip_all, fields(provider = %self.provider.as_str(), model = %request.model_id, ratio = %request.ratio))]
    async fn generate_image(&self, request: &ImageRequest) -> Result<ImageBytes, ImageGenError> {
        let body = json!({
            "model": request.model_id,
            "prompt": request.prompt,
            "size": size_for(request.ratio),
            "n": 1,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, None))?;
        let resp = check_status(resp).await?;
        let parsed: ImagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let encoded = parsed
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or(ImageGenError::EmptyResult)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ImageGenError::Provider(format!("invalid base64 image data: {e}")))?;
        Ok(ImageBytes {
            bytes,
            mime_type: "image/png".into(),
        })
    }
}
