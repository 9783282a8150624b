//! Prompt assembly for page renders and virtual REST queries.
//!
//! Message layout: one system message with the mode's rules, one user
//! message with the stable app context (brief, attachments), one user message
//! per selected history entry, and a final user message describing the
//! current request. The system message and the newest history message carry
//! cache breakpoints.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use mirage_core::history::{BriefAttachment, EntryKind, HistoryEntry, JsonMap};
use mirage_core::ids::BranchId;
use mirage_core::provider::ChatMessage;

const LINE_DIVIDER: &str = "----------------------------------------";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PromptMode {
    #[default]
    Page,
    JsonQuery,
}

/// History chosen for the prompt plus the bookkeeping shown to the model.
#[derive(Clone, Copy, Debug)]
pub struct HistoryWindow<'a> {
    pub entries: &'a [Arc<HistoryEntry>],
    pub total: usize,
    pub limit: usize,
    pub limit_omitted: usize,
    pub byte_omitted: usize,
}

impl HistoryWindow<'_> {
    pub fn empty() -> HistoryWindow<'static> {
        HistoryWindow {
            entries: &[],
            total: 0,
            limit: 0,
            limit_omitted: 0,
            byte_omitted: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromptContext<'a> {
    pub mode: PromptMode,
    pub brief: &'a str,
    pub brief_attachments: &'a [BriefAttachment],
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a JsonMap,
    pub body: &'a JsonMap,
    pub prev_html: &'a str,
    pub timestamp: Option<DateTime<Utc>>,
    pub branch_id: Option<&'a BranchId>,
    pub branch_instructions: Option<&'a str>,
    pub include_instruction_panel: bool,
    pub image_generation_enabled: bool,
    pub history: HistoryWindow<'a>,
}

pub fn build_messages(ctx: &PromptContext<'_>) -> Vec<ChatMessage> {
    let mut system = ChatMessage::system(system_rules(ctx).join("\n"));
    system.cache_breakpoint = true;

    let mut messages = vec![system, ChatMessage::user(stable_context(ctx))];

    let mut history: Vec<ChatMessage> = ctx
        .history
        .entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| ChatMessage::user(format_history_entry(entry, idx)))
        .collect();
    if let Some(last) = history.last_mut() {
        last.cache_breakpoint = true;
    }
    messages.extend(history);

    messages.push(ChatMessage::user(dynamic_context(ctx)));
    messages
}

fn system_rules(ctx: &PromptContext<'_>) -> Vec<&'static str> {
    match ctx.mode {
        PromptMode::JsonQuery => vec![
            "You are the data backend of a web application whose pages are generated on demand.",
            "Reply with ONLY one valid JSON document (object or array) answering the current query.",
            "",
            "Rules:",
            "1) Output raw JSON. No code fences, comments or prose.",
            "2) Derive field names and structure from the HTML you produced earlier and from prior query responses.",
            "3) Treat recorded mutations and prior query results as authoritative state.",
            "4) Produce realistic, detailed data consistent with the app brief.",
            "5) Never return image URLs; describe images with a text prompt field instead.",
        ],
        PromptMode::Page => {
            let mut rules = vec![
                "You are the server of a web application that has no source code: every page is generated by you.",
                "Render the single view requested below as one complete <html> document.",
                "",
                "Rules:",
                "1) Output exactly one <html>...</html> document. No markdown, no explanations.",
                "2) Inline all CSS and JS. No external CDNs or remote images.",
                "3) Derive all state from the brief, the history, the previous HTML and the recorded REST mutations and queries.",
                "4) Carry state forward through links, form fields or an <!-- app-state: {...} --> comment.",
                "5) Use POST /rest_api/mutation/* to record state changes; it returns only {\"success\": true}.",
                "6) Use GET or POST /rest_api/query/* on explicit user action to fetch JSON shaped for your UI.",
                "7) Reflect recorded mutations as already applied.",
                "8) Semantic, accessible markup with realistic content; no lorem ipsum.",
            ];
            if ctx.image_generation_enabled {
                rules.push("Images: for raster images use <ai-image prompt=\"...\" ratio=\"1:1|16:9|9:16|4:3|3:4\"></ai-image>; reuse identical prompt and ratio to hit the cache.");
            }
            if ctx.include_instruction_panel {
                rules.push("Instructions panel: keep the floating instructions panel the host injects; do not render your own.");
            }
            rules
        }
    }
}

fn stable_context(ctx: &PromptContext<'_>) -> String {
    let mut lines = vec![format!("App Brief:\n{}", ctx.brief)];
    if !ctx.brief_attachments.is_empty() {
        lines.push(String::new());
        lines.push("Brief Attachments:".to_string());
        for attachment in ctx.brief_attachments {
            lines.push(format!(
                "- {} ({}, {} bytes)",
                attachment.name, attachment.mime_type, attachment.size
            ));
        }
    }
    lines.join("\n")
}

fn dynamic_context(ctx: &PromptContext<'_>) -> String {
    let mut lines = history_summary(&ctx.history);
    lines.push(String::new());
    lines.push("Current Request:".to_string());
    if let Some(ts) = ctx.timestamp {
        lines.push(format!("- Timestamp: {}", ts.to_rfc3339_opts(SecondsFormat::Millis, true)));
    }
    lines.push(format!("- Method: {}", ctx.method));
    lines.push(format!("- Path: {}", ctx.path));
    if let Some(branch) = ctx.branch_id {
        lines.push(format!("- Branch: {branch}"));
    }
    if let Some(instructions) = ctx.branch_instructions {
        lines.push(format!("- Branch Instructions: {instructions}"));
    }
    lines.push(format!("- Query Params (URL-decoded JSON): {}", pretty(ctx.query)));
    lines.push(format!("- Body Params (URL-decoded JSON): {}", pretty(ctx.body)));
    lines.push(String::new());
    lines.push("Previous HTML (your last output; use history for older states):".to_string());
    lines.push("-----BEGIN PREVIOUS HTML-----".to_string());
    lines.push(ctx.prev_html.to_string());
    lines.push("-----END PREVIOUS HTML-----".to_string());
    lines.join("\n")
}

pub fn history_summary(history: &HistoryWindow<'_>) -> Vec<String> {
    if history.entries.is_empty() {
        return vec![
            "History Summary:".to_string(),
            "- No previous pages for this session yet.".to_string(),
        ];
    }
    let mut lines = vec![
        "History Summary:".to_string(),
        format!(
            "- Entries included: {} of {} (limit {})",
            history.entries.len(),
            history.total,
            history.limit
        ),
    ];
    let mut omitted = Vec::new();
    if history.limit_omitted > 0 {
        omitted.push(format!("{} via entry limit", history.limit_omitted));
    }
    if history.byte_omitted > 0 {
        omitted.push(format!("{} via byte budget", history.byte_omitted));
    }
    if !omitted.is_empty() {
        lines.push(format!("- Omitted entries: {}", omitted.join(", ")));
    }
    lines
}

pub fn format_history_entry(entry: &HistoryEntry, index: usize) -> String {
    let mut lines = vec![
        format!("History Entry {} [{}] ({})", index + 1, entry.entry_kind.label(), entry.id),
        LINE_DIVIDER.to_string(),
        format!("Timestamp: {}", entry.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        format!("Duration: {} ms", entry.duration_ms),
        format!("Request Method: {}", entry.request.method),
        format!("Request Path: {}", entry.request.path),
        format!("Query Params (JSON): {}", pretty(&entry.request.query)),
        format!("Body Params (JSON): {}", pretty(&entry.request.body)),
    ];
    if let Some(instructions) = &entry.request.instructions {
        lines.push(format!("Instructions Provided: {instructions}"));
    }

    if entry.entry_kind == EntryKind::Html {
        if let Some(llm) = &entry.llm {
            lines.push(format!("LLM Provider: {}", llm.provider));
            lines.push(format!("LLM Model: {}", llm.model));
        }
        if !entry.brief_attachments.is_empty() {
            lines.push("Brief Attachments included in this step:".to_string());
            for att in &entry.brief_attachments {
                lines.push(format!("- {} ({})", att.name, att.mime_type));
            }
        }
        if !entry.rest_mutations.is_empty() {
            lines.push("REST Mutations Recorded During This Step:".to_string());
            for m in &entry.rest_mutations {
                lines.push(format!("  - {} {} -> {}", m.method, m.path, inline(&m.body)));
            }
        }
        if !entry.rest_queries.is_empty() {
            lines.push("REST Queries Recorded During This Step:".to_string());
            for q in &entry.rest_queries {
                let outcome = if q.ok { "OK" } else { "Error" };
                lines.push(format!("  - {} {} -> {}: {}", q.method, q.path, outcome, inline(&q.response)));
            }
        }
        if !entry.generated_images.is_empty() {
            lines.push("Images Generated During This Step:".to_string());
            for img in &entry.generated_images {
                lines.push(format!("  - [{}] {} -> {}", img.ratio, img.prompt, img.url));
            }
        }
        lines.push("Generated HTML:".to_string());
        lines.push("-----BEGIN HTML-----".to_string());
        lines.push(entry.response.html.clone());
        lines.push("-----END HTML-----".to_string());
        return lines.join("\n");
    }

    if let Some(rest) = &entry.rest {
        if let Some(ok) = rest.ok {
            lines.push(format!("Outcome: {}", if ok { "success" } else { "error" }));
        }
        if let Some(error) = &rest.error {
            lines.push(format!("Error: {error}"));
        }
    }
    if let Some(tokens) = entry.usage.as_ref().and_then(|u| u.reasoning_tokens) {
        lines.push(format!("Reasoning Tokens: {tokens}"));
    }
    match &entry.rest {
        Some(rest) if rest.response.is_some() => {
            lines.push("Response JSON:".to_string());
            let body = rest.response.as_ref().map(pretty).unwrap_or_default();
            lines.extend(indent(&body));
        }
        Some(rest) => {
            if let Some(raw) = rest.raw_response.as_deref().filter(|r| !r.is_empty()) {
                lines.push("Raw Response Payload:".to_string());
                lines.extend(indent(raw));
            }
        }
        None => {}
    }
    lines.join("\n")
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

fn inline(value: &(impl serde::Serialize + ?Sized)) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn indent(text: &str) -> Vec<String> {
    text.split('\n').map(|line| format!("  {line}")).collect()
}
