//! Export/import format for a session's main timeline.

use chrono::{DateTime, Utc};
use mirage_core::history::{BriefAttachment, GeneratedImage, HistoryEntry, LlmInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Prompt-budget settings travelling with a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRuntime {
    #[serde(default)]
    pub history_limit: usize,
    #[serde(default)]
    pub history_max_bytes: usize,
    #[serde(default)]
    pub include_instruction_panel: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default)]
    pub brief_attachments: Vec<BriefAttachment>,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub runtime: SnapshotRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmInfo>,
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
}

/// Process-level context the store does not own but a snapshot records.
#[derive(Clone, Debug, Default)]
pub struct SnapshotMeta {
    pub brief: Option<String>,
    pub brief_attachments: Vec<BriefAttachment>,
    pub runtime: SnapshotRuntime,
    pub llm: Option<LlmInfo>,
}

impl HistorySnapshot {
    /// Parse an uploaded snapshot, checking shape before full decoding so
    /// callers get a precise error.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        let Some(obj) = value.as_object() else {
            return Err(StoreError::InvalidSnapshot("snapshot must be a JSON object".into()));
        };
        match obj.get("version").and_then(Value::as_u64) {
            Some(v) if v == u64::from(SNAPSHOT_VERSION) => {}
            Some(v) => {
                return Err(StoreError::InvalidSnapshot(format!(
                    "unsupported snapshot version {v}"
                )))
            }
            None => return Err(StoreError::InvalidSnapshot("missing snapshot version".into())),
        }
        if !obj.get("history").is_some_and(Value::is_array) {
            return Err(StoreError::InvalidSnapshot("history must be an array".into()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Settings the importer should adopt: positive budgets and a non-blank brief.
    pub fn runtime_overrides(&self) -> (Option<usize>, Option<usize>, Option<&str>) {
        let limit = Some(self.runtime.history_limit).filter(|n| *n > 0);
        let max_bytes = Some(self.runtime.history_max_bytes).filter(|n| *n > 0);
        let brief = self.brief.as_deref().map(str::trim).filter(|b| !b.is_empty());
        (limit, max_bytes, brief)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_wrong_version() {
        let err = HistorySnapshot::from_value(json!({"version": 2, "history": []})).unwrap_err();
        assert!(err.to_string().contains("unsupported snapshot version 2"));
    }

    #[test]
    fn rejects_non_array_history() {
        let err = HistorySnapshot::from_value(json!({"version": 1, "history": {}})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidSnapshot(_)));
    }

    #[test]
    fn minimal_snapshot_defaults_optional_sections() {
        let snapshot = HistorySnapshot::from_value(json!({
            "version": 1,
            "exportedAt": "2026-01-01T00:00:00Z",
            "history": []
        }))
        .unwrap();
        assert!(snapshot.generated_images.is_empty());
        assert_eq!(snapshot.runtime, SnapshotRuntime::default());
        assert_eq!(snapshot.runtime_overrides(), (None, None, None));
    }

    #[test]
    fn overrides_keep_positive_values() {
        let snapshot = HistorySnapshot::from_value(json!({
            "version": 1,
            "exportedAt": "2026-01-01T00:00:00Z",
            "brief": "  a todo app ",
            "history": [],
            "runtime": {"historyLimit": 12, "historyMaxBytes": 0}
        }))
        .unwrap();
        assert_eq!(snapshot.runtime_overrides(), (Some(12), None, Some("a todo app")));
    }
}
