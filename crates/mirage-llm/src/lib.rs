pub mod normalize;
pub mod openai;
pub mod prompt;

pub mod mock;

pub use mock::{MockImageClient, MockLlmClient, MockReply};
pub use normalize::{normalize_html_response, normalize_json_response, parse_json_response};
pub use openai::{ClientSettings, OpenAiCompatClient, OpenAiImageClient};
pub use prompt::{build_messages, HistoryWindow, PromptContext, PromptMode};
