use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ImageGenError, ProviderError};
use crate::history::{ImageGenProvider, ImageRatio, LlmInfo, ReasoningTrace, UsageMetrics};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Openai,
    Gemini,
    Anthropic,
    Grok,
    Groq,
    Openrouter,
}

impl ModelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::Grok => "grok",
            Self::Groq => "groq",
            Self::Openrouter => "openrouter",
        }
    }
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    None,
    Low,
    Medium,
    High,
    Xhigh,
    #[default]
    Default,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

/// One prompt message handed to the LLM collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Hint that this message ends a cacheable prefix.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_breakpoint: bool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            cache_breakpoint: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            cache_breakpoint: false,
        }
    }
}

/// Provider output normalized to a single shape before it reaches the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResult {
    pub html: String,
    pub usage: Option<UsageMetrics>,
    pub reasoning: Option<ReasoningTrace>,
}

/// Trait implemented by each LLM backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> ModelProvider;
    fn model(&self) -> &str;
    fn max_output_tokens(&self) -> u32;

    fn reasoning_mode(&self) -> ReasoningMode {
        ReasoningMode::Default
    }

    fn reasoning_tokens(&self) -> Option<i64> {
        None
    }

    /// Description of this client recorded on every entry it produces.
    fn llm_info(&self) -> LlmInfo {
        LlmInfo {
            provider: self.provider(),
            model: self.model().to_string(),
            max_output_tokens: self.max_output_tokens(),
            reasoning_mode: self.reasoning_mode(),
            reasoning_tokens: self.reasoning_tokens(),
        }
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<LlmResult, ProviderError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    pub ratio: ImageRatio,
    pub model_id: String,
    pub api_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Trait implemented by each image-generation backend.
#[async_trait]
pub trait ImageGenClient: Send + Sync {
    fn provider(&self) -> ImageGenProvider;

    async fn generate_image(&self, request: &ImageRequest) -> Result<ImageBytes, ImageGenError>;
}
