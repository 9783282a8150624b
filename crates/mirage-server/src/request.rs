//! Inbound request plumbing shared by every route: query/body decoding,
//! branch resolution, parameter sanitisation and the session cookie.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, Method, Uri};
use axum::response::Response;
use mirage_core::history::JsonMap;
use mirage_core::ids::BranchId;
use mirage_store::{RestCall, SessionLease};
use serde_json::Value;

/// Request field carrying the branch a write belongs to.
pub const BRANCH_FIELD: &str = "__mirage_branch";
/// Marker the navigation interceptor adds to requests it rewrites.
pub const MARKER_FIELD: &str = "__mirage";
pub const SESSION_COOKIE: &str = "sid";

const INTERCEPTOR_VALUE: &str = "interceptor";

/// A request reduced to what gets recorded plus the branch it targets.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub call: RestCall,
    pub branch: Option<BranchId>,
}

impl Inbound {
    /// Bodies of GET/HEAD requests are ignored.
    pub fn parse(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Self {
        let pairs = query_pairs(uri.query());
        let raw_body = if *method == Method::GET || *method == Method::HEAD {
            JsonMap::new()
        } else {
            parse_body(headers, body)
        };
        Self {
            branch: resolve_branch(&pairs, &raw_body),
            call: RestCall {
                method: method.as_str().to_string(),
                path: uri.path().to_string(),
                query: sanitize_query(&pairs),
                body: sanitize_body(&raw_body),
            },
        }
    }
}

/// Decoded query-string pairs in arrival order.
pub fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .into_owned()
            .collect()
    })
    .unwrap_or_default()
}

/// Decode a request body into a JSON object according to its content type.
///
/// Non-object JSON is wrapped as `{"value": ..}`; unparseable or unknown
/// bodies are kept as `{"_raw": ..}`.
pub fn parse_body(headers: &HeaderMap, body: &[u8]) -> JsonMap {
    if body.is_empty() {
        return JsonMap::new();
    }
    let raw = String::from_utf8_lossy(body);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match content_type.as_str() {
        "application/json" => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => single("value", other),
            Err(_) => single("_raw", Value::String(raw.into_owned())),
        },
        "application/x-www-form-urlencoded" => form_map(&raw),
        _ => single("_raw", Value::String(raw.into_owned())),
    }
}

fn single(key: &str, value: Value) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert(key.to_string(), value);
    map
}

/// Repeated form keys become arrays.
fn form_map(raw: &str) -> JsonMap {
    let mut map = JsonMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()).into_owned() {
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    map
}

/// The branch a request targets: the query parameter wins over the body field.
pub fn resolve_branch(query: &[(String, String)], body: &JsonMap) -> Option<BranchId> {
    query
        .iter()
        .filter(|(k, _)| k == BRANCH_FIELD)
        .find_map(|(_, v)| BranchId::parse(v))
        .or_else(|| match body.get(BRANCH_FIELD)? {
            Value::String(s) => BranchId::parse(s),
            Value::Array(items) => items.iter().filter_map(Value::as_str).find_map(BranchId::parse),
            _ => None,
        })
}

/// Query parameters as recorded in history: internal fields dropped, last
/// value wins for repeated keys.
pub fn sanitize_query(pairs: &[(String, String)]) -> JsonMap {
    pairs
        .iter()
        .filter(|(k, _)| !is_internal(k))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Body fields as recorded in history: internal fields and interceptor
/// markers dropped, single-item arrays collapsed.
pub fn sanitize_body(body: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    for (key, value) in body {
        if is_internal(key) {
            continue;
        }
        match value {
            Value::Array(items) => {
                let mut kept: Vec<Value> = items
                    .iter()
                    .filter(|v| v.as_str() != Some(INTERCEPTOR_VALUE))
                    .cloned()
                    .collect();
                match kept.len() {
                    0 => {}
                    1 => {
                        out.insert(key.clone(), kept.remove(0));
                    }
                    _ => {
                        out.insert(key.clone(), Value::Array(kept));
                    }
                }
            }
            Value::String(s) if s == INTERCEPTOR_VALUE => {}
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

fn is_internal(key: &str) -> bool {
    key == BRANCH_FIELD || key == MARKER_FIELD
}

pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| k.trim() == SESSION_COOKIE)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn set_cookie_value(lease: &SessionLease, ttl: Option<Duration>) -> String {
    let mut parts = vec![format!("{SESSION_COOKIE}={}", lease.id())];
    if let Some(ttl) = ttl {
        parts.push(format!("Max-Age={}", ttl.as_secs()));
    }
    parts.extend(["Path=/".to_string(), "HttpOnly".to_string(), "SameSite=Lax".to_string()]);
    parts.join("; ")
}

/// Attach `Set-Cookie` when the lease created the session.
pub fn with_session_cookie(mut response: Response, lease: &SessionLease, ttl: Option<Duration>) -> Response {
    if lease.is_new() {
        if let Ok(value) = HeaderValue::from_str(&set_cookie_value(lease, ttl)) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn query_branch_beats_body_branch() {
        let body = obj(json!({"__mirage_branch": "branch_body"}));
        let q = pairs(&[("__mirage_branch", "  branch_query ")]);
        assert_eq!(resolve_branch(&q, &body), Some(BranchId::from_raw("branch_query")));
        assert_eq!(resolve_branch(&[], &body), Some(BranchId::from_raw("branch_body")));
        let blank = pairs(&[("__mirage_branch", "  ")]);
        assert_eq!(resolve_branch(&blank, &JsonMap::new()), None);
    }

    #[test]
    fn body_branch_array_takes_first_non_blank() {
        let body = obj(json!({"__mirage_branch": ["", " branch_b"]}));
        assert_eq!(resolve_branch(&[], &body), Some(BranchId::from_raw("branch_b")));
    }

    #[test]
    fn sanitize_strips_internal_fields() {
        let q = pairs(&[("page", "1"), ("__mirage", "interceptor"), ("__mirage_branch", "b"), ("page", "2")]);
        assert_eq!(sanitize_query(&q), obj(json!({"page": "2"})));

        let body = obj(json!({
            "__mirage": "interceptor",
            "__mirage_branch": "b",
            "title": "milk",
            "tags": ["interceptor", "dairy"],
            "source": "interceptor",
            "empty": ["interceptor"],
            "ids": [1, 2],
        }));
        assert_eq!(
            sanitize_body(&body),
            obj(json!({"title": "milk", "tags": "dairy", "ids": [1, 2]}))
        );
    }

    #[test]
    fn body_decoding_by_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert_eq!(parse_body(&headers, br#"{"a":1}"#), obj(json!({"a": 1})));
        assert_eq!(parse_body(&headers, b"[1]"), obj(json!({"value": [1]})));
        assert_eq!(parse_body(&headers, b"{oops"), obj(json!({"_raw": "{oops"})));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        assert_eq!(
            parse_body(&headers, b"a=1&b=x+y&a=2"),
            obj(json!({"a": ["1", "2"], "b": "x y"}))
        );
        assert!(parse_body(&headers, b"").is_empty());
    }

    #[test]
    fn inbound_resolves_branch_and_cleans_params() {
        let uri: Uri = "/rest_api/mutation/todos?__mirage_branch=branch_a&done=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let inbound = Inbound::parse(&Method::POST, &uri, &headers, br#"{"__mirage_branch":"branch_b","title":"milk"}"#);
        assert_eq!(inbound.branch, Some(BranchId::from_raw("branch_a")));
        assert_eq!(inbound.call.path, "/rest_api/mutation/todos");
        assert_eq!(inbound.call.query, obj(json!({"done": "1"})));
        assert_eq!(inbound.call.body, obj(json!({"title": "milk"})));

        let get = Inbound::parse(&Method::GET, &"/q".parse().unwrap(), &headers, br#"{"a":1}"#);
        assert!(get.call.body.is_empty());
    }

    #[test]
    fn cookie_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; sid=sess_abc ; x=1"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("sess_abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("sid="));
        assert_eq!(session_cookie(&headers), None);
    }
}
