//! Budget-aware history selection for prompt construction.

use std::sync::Arc;

use mirage_core::history::HistoryEntry;

/// Extra bytes charged per entry for the labels and separators the prompt
/// formatter wraps around it.
pub const ENTRY_SIZE_CUSHION: usize = 1024;

#[derive(Clone, Debug, Default)]
pub struct HistorySelection {
    /// Selected entries, oldest first.
    pub entries: Vec<Arc<HistoryEntry>>,
    /// Length of the history the selection was made from.
    pub total: usize,
    /// Entries dropped by the entry-count window.
    pub history_limit_omitted: usize,
    /// Entries inside the window dropped by the byte budget.
    pub byte_omitted: usize,
    /// Estimated size of `entries`.
    pub bytes_used: usize,
}

/// Pick the entries to inject into a prompt.
///
/// The last `entry_limit` entries form the window; from that window the
/// longest run of newest entries whose estimated size fits `byte_budget` is
/// kept. A `byte_budget` of 0 means unlimited. The newest entry is always
/// kept when the window is non-empty, even if it alone exceeds the budget.
pub fn select_history(
    history: &[Arc<HistoryEntry>],
    entry_limit: usize,
    byte_budget: usize,
) -> HistorySelection {
    let total = history.len();
    let window_start = total.saturating_sub(entry_limit);
    let window = &history[window_start..];
    let budget = if byte_budget == 0 { usize::MAX } else { byte_budget };

    let mut bytes_used = 0usize;
    let mut first_kept = window.len();
    for (idx, entry) in window.iter().enumerate().rev() {
        let size = estimate_entry_size(entry);
        if first_kept < window.len() && bytes_used.saturating_add(size) > budget {
            break;
        }
        bytes_used = bytes_used.saturating_add(size);
        first_kept = idx;
    }

    let entries = window[first_kept..].to_vec();
    HistorySelection {
        byte_omitted: window.len() - entries.len(),
        history_limit_omitted: window_start,
        entries,
        total,
        bytes_used,
    }
}

/// Approximate prompt footprint of one entry in bytes.
pub fn estimate_entry_size(entry: &HistoryEntry) -> usize {
    let mut bytes = ENTRY_SIZE_CUSHION;
    bytes += entry.brief.as_deref().map_or(0, str::len);
    bytes += entry.request.method.len();
    bytes += entry.request.path.len();
    bytes += pretty_len(&entry.request.query);
    bytes += pretty_len(&entry.request.body);
    bytes += entry.request.instructions.as_deref().map_or(0, str::len);
    bytes += entry.response.html.len();
    if let Some(usage) = &entry.usage {
        bytes += pretty_len(usage);
    }
    for attachment in &entry.brief_attachments {
        bytes += attachment.base64.len() + attachment.name.len() + attachment.mime_type.len();
    }
    if let Some(reasoning) = &entry.reasoning {
        bytes += joined_len(&reasoning.summaries);
        bytes += joined_len(&reasoning.details);
    }
    bytes
}

fn pretty_len<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_string_pretty(value).map_or(0, |s| s.len())
}

fn joined_len(parts: &[String]) -> usize {
    if parts.is_empty() {
        return 0;
    }
    parts.iter().map(String::len).sum::<usize>() + parts.len() - 1
}
