use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mirage_core::errors::{ImageGenError, ProviderError};
use mirage_core::history::{ImageGenProvider, UsageMetrics};
use mirage_core::provider::{
    ChatMessage, ImageBytes, ImageGenClient, ImageRequest, LlmClient, LlmResult, ModelProvider,
};

/// Pre-programmed replies for deterministic tests without API calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(ProviderError),
    /// Wait, then produce the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock LLM that returns scripted replies in order. Once the script is
/// exhausted the fallback reply (if any) is repeated.
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    call_count: AtomicUsize,
}

impl MockLlmClient {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Always answer with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        let mut mock = Self::new(Vec::new());
        mock.fallback = Some(MockReply::text(text));
        mock
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompt messages of the most recent call.
    pub fn last_messages(&self) -> Option<Vec<ChatMessage>> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> ModelProvider {
        ModelProvider::Openai
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn max_output_tokens(&self) -> u32 {
        4096
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<LlmResult, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(messages.to_vec());

        let scripted = self.replies.lock().pop_front();
        let Some(mut reply) = scripted.or_else(|| self.fallback.clone()) else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockLlmClient: no reply configured for call {idx}"
            )));
        };
        loop {
            match reply {
                MockReply::Text(text) => {
                    return Ok(LlmResult {
                        html: text,
                        usage: Some(UsageMetrics {
                            input_tokens: Some(10),
                            output_tokens: Some(20),
                            reasoning_tokens: None,
                            total_tokens: Some(30),
                        }),
                        reasoning: None,
                    })
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Mock image generator returning fixed bytes.
pub struct MockImageClient {
    provider: ImageGenProvider,
    bytes: Vec<u8>,
    failure: Option<String>,
    call_count: AtomicUsize,
}

impl MockImageClient {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            provider: ImageGenProvider::Openai,
            bytes,
            failure: None,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let mut mock = Self::new(Vec::new());
        mock.failure = Some(message.into());
        mock
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ImageGenClient for MockImageClient {
    fn provider(&self) -> ImageGenProvider {
        self.provider
    }

    async fn generate_image(&self, _request: &ImageRequest) -> Result<ImageBytes, ImageGenError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = &self.failure {
            return Err(ImageGenError::Provider(message.clone()));
        }
        Ok(ImageBytes {
            bytes: self.bytes.clone(),
            mime_type: "image/png".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_core::history::ImageRatio;

    #[tokio::test]
    async fn scripted_replies_in_order() {
        let mock = MockLlmClient::new(vec![MockReply::text("one"), MockReply::text("two")]);
        let msgs = [ChatMessage::user("hi")];
        assert_eq!(mock.generate(&msgs).await.unwrap().html, "one");
        assert_eq!(mock.generate(&msgs).await.unwrap().html, "two");
        assert!(mock.generate(&msgs).await.is_err());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.last_messages().unwrap()[0].content, "hi");
    }

    #[tokio::test]
    async fn always_repeats() {
        let mock = MockLlmClient::always("<html></html>");
        for _ in 0..3 {
            assert_eq!(mock.generate(&[]).await.unwrap().html, "<html></html>");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let mock = MockLlmClient::new(vec![MockReply::delayed(
            Duration::from_secs(5),
            MockReply::Error(ProviderError::NetworkError("reset".into())),
        )]);
        let start = tokio::time::Instant::now();
        let err = mock.generate(&[]).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(err.error_kind(), "network_error");
    }

    #[tokio::test]
    async fn image_mock_counts_calls() {
        let mock = MockImageClient::new(vec![1, 2]);
        let req = ImageRequest {
            prompt: "p".into(),
            ratio: ImageRatio::Square,
            model_id: "m".into(),
            api_key: "k".into(),
        };
        assert_eq!(mock.generate_image(&req).await.unwrap().bytes, vec![1, 2]);
        assert_eq!(mock.call_count(), 1);
        assert!(MockImageClient::failing("nope").generate_image(&req).await.is_err());
    }
}
