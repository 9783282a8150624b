//! The append-only history record shared by every component.
//!
//! Serialized field names are camelCase so snapshots stay readable by the
//! browser-side admin tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{BranchId, EntryId, ForkId, ImageId, RecordId, SessionId};
use crate::provider::{ModelProvider, ReasoningMode};

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Html,
    RestMutation,
    RestQuery,
}

impl EntryKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Html => "HTML",
            Self::RestMutation => "REST Mutation",
            Self::RestQuery => "REST Query",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: JsonMap,
    #[serde(default)]
    pub body: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub html: String,
}

/// Which model produced an entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmInfo {
    pub provider: ModelProvider,
    pub model: String,
    pub max_output_tokens: u32,
    pub reasoning_mode: ReasoningMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summaries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// One client-reported state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestMutationRecord {
    pub id: RecordId,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub query: JsonMap,
    #[serde(default)]
    pub body: JsonMap,
    pub created_at: DateTime<Utc>,
}

/// One LLM-answered virtual read, successful or not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestQueryRecord {
    pub id: RecordId,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub query: JsonMap,
    #[serde(default)]
    pub body: JsonMap,
    pub created_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestKind {
    Mutation,
    Query,
}

/// REST call details carried by `rest-mutation`/`rest-query` entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestMetadata {
    #[serde(rename = "type")]
    pub kind: RestKind,
    pub request: RequestInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "3:4")]
    Portrait,
}

impl ImageRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Wide => "16:9",
            Self::Tall => "9:16",
            Self::Landscape => "4:3",
            Self::Portrait => "3:4",
        }
    }

    /// Unknown or missing ratios fall back to square.
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("16:9") => Self::Wide,
            Some("9:16") => Self::Tall,
            Some("4:3") => Self::Landscape,
            Some("3:4") => Self::Portrait,
            _ => Self::Square,
        }
    }
}

impl std::fmt::Display for ImageRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageGenProvider {
    #[default]
    Openai,
    Gemini,
    Openrouter,
}

impl ImageGenProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Openrouter => "openrouter",
        }
    }
}

/// One cached generated image as associated with a session timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub id: ImageId,
    pub cache_key: String,
    pub url: String,
    pub prompt: String,
    pub ratio: ImageRatio,
    pub provider: ImageGenProvider,
    pub model_id: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefAttachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub base64: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchLabel {
    A,
    B,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForkEntryStatus {
    InProgress,
    Chosen,
    Discarded,
}

/// Marks an entry as written to one side of an A/B fork.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkInfo {
    pub fork_id: ForkId,
    pub branch_id: BranchId,
    pub label: BranchLabel,
    pub status: ForkEntryStatus,
}

/// One immutable step of a session timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: EntryId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brief_attachments: Vec<BriefAttachment>,
    pub request: RequestInfo,
    pub response: ResponseInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rest_mutations: Vec<RestMutationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rest_queries: Vec<RestQueryRecord>,
    pub entry_kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_info: Option<ForkInfo>,
}

impl HistoryEntry {
    pub fn branch_id(&self) -> Option<&BranchId> {
        self.fork_info.as_ref().map(|f| &f.branch_id)
    }
}

/// Everything about an entry except what the store stamps on append
/// (id, session, timestamp, fork membership).
#[derive(Clone, Debug, PartialEq)]
pub struct EntryDraft {
    pub kind: EntryKind,
    pub request: RequestInfo,
    pub html: String,
    pub duration_ms: u64,
    pub brief: Option<String>,
    pub brief_attachments: Vec<BriefAttachment>,
    pub llm: Option<LlmInfo>,
    pub usage: Option<UsageMetrics>,
    pub reasoning: Option<ReasoningTrace>,
    pub rest: Option<RestMetadata>,
}

impl EntryDraft {
    pub fn html(request: RequestInfo, html: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Html,
            request,
            html: html.into(),
            duration_ms: 0,
            brief: None,
            brief_attachments: Vec::new(),
            llm: None,
            usage: None,
            reasoning: None,
            rest: None,
        }
    }

    /// A `rest-mutation` or `rest-query` entry built from its metadata block.
    pub fn rest(rest: RestMetadata) -> Self {
        let kind = match rest.kind {
            RestKind::Mutation => EntryKind::RestMutation,
            RestKind::Query => EntryKind::RestQuery,
        };
        Self {
            kind,
            request: rest.request.clone(),
            html: String::new(),
            duration_ms: 0,
            brief: None,
            brief_attachments: Vec::new(),
            llm: None,
            usage: None,
            reasoning: None,
            rest: Some(rest),
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn with_brief(mut self, brief: Option<String>, attachments: Vec<BriefAttachment>) -> Self {
        self.brief = brief;
        self.brief_attachments = attachments;
        self
    }

    pub fn with_llm(mut self, llm: LlmInfo) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_usage(mut self, usage: Option<UsageMetrics>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_reasoning(mut self, reasoning: Option<ReasoningTrace>) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn into_entry(
        self,
        id: EntryId,
        session_id: SessionId,
        created_at: DateTime<Utc>,
        fork_info: Option<ForkInfo>,
    ) -> HistoryEntry {
        HistoryEntry {
            id,
            session_id,
            created_at,
            duration_ms: self.duration_ms,
            brief: self.brief,
            brief_attachments: self.brief_attachments,
            request: self.request,
            response: ResponseInfo { html: self.html },
            llm: self.llm,
            usage: self.usage,
            reasoning: self.reasoning,
            rest_mutations: Vec::new(),
            rest_queries: Vec::new(),
            entry_kind: self.kind,
            rest: self.rest,
            generated_images: Vec::new(),
            fork_info,
        }
    }
}
