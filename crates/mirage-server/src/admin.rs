//! Operator routes under `/__mirage`: fork lifecycle, history export and
//! import, and a session listing.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mirage_core::ids::{BranchId, EntryId, ForkId, SessionId};
use mirage_store::{HistorySnapshot, SnapshotMeta, StoreError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::request::session_cookie;
use crate::server::AppState;

/// Decode a JSON request body; an empty body reads as `{}`.
fn json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let raw = if body.iter().all(u8::is_ascii_whitespace) { b"{}".as_slice() } else { body };
    serde_json::from_slice(raw).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn known_session(state: &AppState, raw: &str) -> Result<SessionId, ApiError> {
    let id = SessionId::from_raw(raw);
    if state.store.contains(&id) {
        Ok(id)
    } else {
        Err(ApiError::NotFound(format!("session not found: {raw}")))
    }
}

fn fork_owner(state: &AppState, fork_id: &ForkId) -> Result<SessionId, ApiError> {
    state
        .store
        .session_for_fork(fork_id)
        .ok_or_else(|| StoreError::NoSuchFork(fork_id.clone()).into())
}

// ── Forks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StartForkBody {
    session_id: Option<String>,
    base_entry_id: Option<String>,
    instructions_a: Option<String>,
    instructions_b: Option<String>,
}

pub async fn start_fork(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    let req: StartForkBody = json_body(&body)?;
    let raw_id = req
        .session_id
        .or_else(|| session_cookie(&headers))
        .ok_or_else(|| ApiError::BadRequest("sessionId is required".into()))?;
    let id = known_session(&state, &raw_id)?;
    let base = req
        .base_entry_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(EntryId::from_raw);
    let fork = state
        .store
        .start_fork(&id, base.as_ref(), req.instructions_a, req.instructions_b)?;
    Ok((StatusCode::CREATED, Json(json!({"success": true, "fork": fork}))).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitForkBody {
    branch_id: String,
}

pub async fn commit_fork(
    State(state): State<AppState>,
    Path(fork_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: CommitForkBody = json_body(&body)?;
    let branch = BranchId::parse(&req.branch_id)
        .ok_or_else(|| ApiError::BadRequest("branchId is required".into()))?;
    let fork_id = ForkId::from_raw(fork_id);
    let id = fork_owner(&state, &fork_id)?;
    let committed = state.store.commit_fork(&id, &fork_id, &branch)?;
    Ok(Json(json!({"success": true, "committed": committed})))
}

pub async fn discard_fork(
    State(state): State<AppState>,
    Path(fork_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let fork_id = ForkId::from_raw(fork_id);
    let id = fork_owner(&state, &fork_id)?;
    state.store.discard_fork(&id, &fork_id)?;
    Ok(Json(json!({"success": true})))
}

pub async fn fork_status(State(state): State<AppState>, Path(sid): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = known_session(&state, &sid)?;
    let fork = state.store.active_fork_summary(&id)?;
    Ok(Json(json!({"active": fork.is_some(), "fork": fork})))
}

// ── History snapshots ───────────────────────────────────────────────────────

pub async fn export_history(State(state): State<AppState>, Path(sid): Path<String>) -> Result<Response, ApiError> {
    let id = known_session(&state, &sid)?;
    let runtime = state.runtime();
    let meta = SnapshotMeta {
        brief: runtime.brief().map(String::from),
        brief_attachments: runtime.brief_attachments.clone(),
        runtime: runtime.snapshot_runtime(),
        llm: state.llm.as_ref().map(|llm| llm.llm_info()),
    };
    let snapshot = state.store.export_snapshot(&id, meta)?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"mirage-history-{id}.json\""))
        .unwrap_or(HeaderValue::from_static("attachment"));
    Ok(([(header::CONTENT_DISPOSITION, disposition)], Json(snapshot)).into_response())
}

pub async fn import_history(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let id = known_session(&state, &sid)?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::from(StoreError::InvalidSnapshot(e.to_string())))?;
    let snapshot = HistorySnapshot::from_value(value)?;

    let (limit, max_bytes, brief) = snapshot.runtime_overrides();
    let brief = brief.map(String::from);
    let attachments = snapshot.brief_attachments.clone();
    let include_panel = snapshot.runtime.include_instruction_panel;
    let imported = state.store.import_snapshot(&id, snapshot)?;

    let mut runtime = state.runtime.write();
    if let Some(limit) = limit {
        runtime.history_limit = limit;
    }
    if let Some(max_bytes) = max_bytes {
        runtime.history_max_bytes = max_bytes;
    }
    if let Some(brief) = brief {
        runtime.brief = Some(brief);
        runtime.brief_attachments = attachments;
    }
    runtime.include_instruction_panel = include_panel;
    drop(runtime);

    tracing::info!(session_id = %id, imported, "history imported");
    Ok(Json(json!({"success": true, "imported": imported})))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.store.list_sessions();
    Json(json!({"sessions": sessions}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{state, TestApp};
    use axum::body::Body;
    use axum::http::Request;
    use mirage_core::history::{EntryDraft, EntryKind, RequestInfo};

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn seeded(app: &TestApp, pages: &[&str]) -> SessionId {
        let id = app.state.store.open_session(None).id().clone();
        for page in pages {
            let request = RequestInfo {
                method: "GET".into(),
                path: format!("/{page}"),
                ..Default::default()
            };
            app.state
                .store
                .append_history_entry(&id, EntryDraft::html(request, format!("<p>{page}</p>")), None)
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn fork_lifecycle_over_http() {
        let app = TestApp::new(state());
        let sid = seeded(&app, &["a", "b"]);

        let (status, _, body) = app
            .send(post("/__mirage/forks", json!({"sessionId": sid.as_str(), "instructionsB": "bold"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let fork_id = body["fork"]["forkId"].as_str().unwrap().to_string();
        let branch_b = body["fork"]["branchB"].as_str().unwrap().to_string();

        let (status, _, body) = app
            .send(post("/__mirage/forks", json!({"sessionId": sid.as_str()})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, _, status_body) = app.send(get(&format!("/__mirage/sessions/{sid}/fork"))).await;
        assert_eq!(status_body["active"], true);
        assert_eq!(status_body["fork"]["branches"][1]["instructions"], "bold");

        let request = RequestInfo { method: "GET".into(), path: "/c".into(), ..Default::default() };
        app.state
            .store
            .append_history_entry(&sid, EntryDraft::html(request, "<p>c</p>"), Some(&BranchId::from_raw(branch_b.as_str())))
            .unwrap();

        let (status, _, body) = app
            .send(post(&format!("/__mirage/forks/{fork_id}/commit"), json!({"branchId": branch_b})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["committed"], 1);

        let history = app.state.store.get_history(&sid).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].request.path, "/c");

        let (status, _, _) = app
            .send(post(&format!("/__mirage/forks/{fork_id}/discard"), json!({})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn discard_restores_main_history() {
        let app = TestApp::new(state());
        let sid = seeded(&app, &["a"]);
        let fork = app.state.store.start_fork(&sid, None, None, None).unwrap();
        let request = RequestInfo { method: "GET".into(), path: "/x".into(), ..Default::default() };
        app.state
            .store
            .append_history_entry(&sid, EntryDraft::html(request, "<p>x</p>"), Some(&fork.branch_a))
            .unwrap();

        let (status, _, _) = app
            .send(Request::post(format!("/__mirage/forks/{}/discard", fork.fork_id)).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.state.store.get_history(&sid).unwrap().len(), 1);
        assert!(!app.state.store.is_fork_active(&sid).unwrap());
    }

    #[tokio::test]
    async fn start_fork_rejects_unknown_session_and_empty_history() {
        let app = TestApp::new(state());
        let (status, _, _) = app
            .send(post("/__mirage/forks", json!({"sessionId": "sess_missing"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let sid = seeded(&app, &[]);
        let (status, _, _) = app
            .send(post("/__mirage/forks", json!({"sessionId": sid.as_str()})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = app.send(post("/__mirage/forks", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "sessionId is required");
    }

    #[tokio::test]
    async fn export_then_import_into_another_session() {
        let app = TestApp::new(state());
        app.state.runtime.write().brief = Some("A recipe site".into());
        let source = seeded(&app, &["home", "recipes"]);

        let (status, headers, snapshot) = app.send(get(&format!("/__mirage/sessions/{source}/history.json"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_DISPOSITION].to_str().unwrap().starts_with("attachment"));
        assert_eq!(snapshot["version"], 1);
        assert_eq!(snapshot["brief"], "A recipe site");
        assert_eq!(snapshot["history"].as_array().unwrap().len(), 2);

        let mut edited = snapshot.clone();
        edited["runtime"]["historyLimit"] = json!(5);
        edited["brief"] = json!("A bakery");

        let target = seeded(&app, &["old"]);
        let (status, _, body) = app
            .send(post(&format!("/__mirage/sessions/{target}/history"), edited))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["imported"], 2);

        let history = app.state.store.get_history(&target).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].request.path, "/recipes");
        assert_eq!(history[1].session_id, target);
        assert_eq!(history[1].entry_kind, EntryKind::Html);
        assert_eq!(app.state.store.get_prev_html(&target, None).unwrap(), "<p>recipes</p>");

        let runtime = app.state.runtime();
        assert_eq!(runtime.history_limit, 5);
        assert_eq!(runtime.brief(), Some("A bakery"));
    }

    #[tokio::test]
    async fn import_rejects_bad_snapshots() {
        let app = TestApp::new(state());
        let sid = seeded(&app, &["a"]);
        let uri = format!("/__mirage/sessions/{sid}/history");

        let (status, _, body) = app.send(post(&uri, json!({"version": 2, "history": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("version"));

        let (status, _, _) = app.send(post(&uri, json!({"version": 1, "history": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.state.store.get_history(&sid).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn export_and_import_refused_during_fork() {
        let app = TestApp::new(state());
        let sid = seeded(&app, &["a"]);
        app.state.store.start_fork(&sid, None, None, None).unwrap();

        let (status, _, _) = app.send(get(&format!("/__mirage/sessions/{sid}/history.json"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn lists_sessions() {
        let app = TestApp::new(state());
        let a = seeded(&app, &["a"]);
        let _b = seeded(&app, &[]);
        let (status, _, body) = app.send(get("/__mirage/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        let sessions = body["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions
            .iter()
            .any(|s| s["sessionId"] == a.as_str() && s["entryCount"] == 1));
    }
}
