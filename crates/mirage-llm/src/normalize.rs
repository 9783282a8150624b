//! Cleanup of raw model text before it is parsed or served.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FULL_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^```[\w-]*\s*\n(.*?)\n?```$").unwrap());

static INLINE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```[\w-]*\s*\n(.*?)\n?```").unwrap());

static HTML_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)(<!doctype html[^>]*>\s*)?<html[\s>].*</html>").unwrap());

/// Strip markdown code fences around a JSON answer.
///
/// A reply that is entirely one fenced block yields its body; otherwise the
/// first fenced block anywhere in the text is used; otherwise the trimmed
/// text is returned unchanged.
pub fn normalize_json_response(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(caps) = FULL_FENCE.captures(trimmed) {
        return caps[1].trim().to_string();
    }
    if let Some(caps) = INLINE_FENCE.captures(trimmed) {
        return caps[1].trim().to_string();
    }
    trimmed.to_string()
}

/// Normalize and parse a JSON answer. An empty answer parses as `{}`.
pub fn parse_json_response(raw: &str) -> Result<Value, String> {
    let normalized = normalize_json_response(raw);
    if normalized.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&normalized).map_err(|e| e.to_string())
}

/// Pull the HTML document out of a page-render reply, dropping fences and
/// any chatter the model wrapped around it.
pub fn normalize_html_response(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = FULL_FENCE
        .captures(trimmed)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_else(|| trimmed.to_string());
    match HTML_DOCUMENT.find(&unfenced) {
        Some(m) => m.as_str().to_string(),
        None => unfenced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_passes_through() {
        assert_eq!(normalize_json_response("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn whole_fenced_block_is_unwrapped() {
        let raw = "```json\n{\"items\": [1, 2]}\n```";
        assert_eq!(normalize_json_response(raw), "{\"items\": [1, 2]}");
    }

    #[test]
    fn fence_inside_prose_is_extracted() {
        let raw = "Sure! ```json\n{\"ok\":true}\n```";
        assert_eq!(parse_json_response(raw).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn invalid_json_reports_error() {
        let err = parse_json_response("here's your data: {not json").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn empty_reply_is_empty_object() {
        assert_eq!(parse_json_response("   ").unwrap(), json!({}));
    }

    #[test]
    fn html_is_extracted_from_chatter() {
        let raw = "Here is the page:\n<!DOCTYPE html>\n<html><body>hi</body></html>\nEnjoy!";
        assert_eq!(
            normalize_html_response(raw),
            "<!DOCTYPE html>\n<html><body>hi</body></html>"
        );
        let fenced = "```html\n<html lang=\"en\"><p>x</p></html>\n```";
        assert_eq!(normalize_html_response(fenced), "<html lang=\"en\"><p>x</p></html>");
        assert_eq!(normalize_html_response("<p>fragment</p>"), "<p>fragment</p>");
    }
}
