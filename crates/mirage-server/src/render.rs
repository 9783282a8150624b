//! Page rendering: every path not claimed by another route is answered with
//! model-generated HTML built from the session's history.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use mirage_core::history::{EntryDraft, RequestInfo};
use mirage_core::ids::{BranchId, SessionId};
use mirage_core::provider::{ChatMessage, LlmClient};
use mirage_llm::{build_messages, normalize_html_response, HistoryWindow, PromptContext, PromptMode};
use mirage_store::{select_history, RestCall};

use crate::error::ApiError;
use crate::request::Inbound;
use crate::rest::{elapsed_ms, finish};
use crate::server::{AppState, RuntimeOptions};

/// Prompt for `call` over the timeline `branch` selects, trimmed to the
/// configured entry and byte budgets.
pub(crate) fn prompt_messages(
    state: &AppState,
    id: &SessionId,
    mode: PromptMode,
    call: &RestCall,
    branch: Option<&BranchId>,
    runtime: &RuntimeOptions,
) -> Result<Vec<ChatMessage>, ApiError> {
    let history = state.store.get_history_for_prompt(id, branch)?;
    let limit = runtime.history_limit.max(1);
    let selection = select_history(&history, limit, runtime.history_max_bytes);
    let prev_html = state.store.get_prev_html(id, branch)?;
    let instructions = state.store.branch_instructions(id, branch)?;
    tracing::debug!(
        session_id = %id,
        selected = selection.entries.len(),
        total = selection.total,
        bytes_used = selection.bytes_used,
        "history selected for prompt"
    );

    let ctx = PromptContext {
        mode,
        brief: runtime.brief().unwrap_or_default(),
        brief_attachments: &runtime.brief_attachments,
        method: &call.method,
        path: &call.path,
        query: &call.query,
        body: &call.body,
        prev_html: &prev_html,
        timestamp: Some(state.store.now()),
        branch_id: branch,
        branch_instructions: instructions.as_deref(),
        include_instruction_panel: runtime.include_instruction_panel,
        image_generation_enabled: state.image_settings.enabled,
        history: HistoryWindow {
            entries: &selection.entries,
            total: selection.total,
            limit,
            limit_omitted: selection.history_limit_omitted,
            byte_omitted: selection.byte_omitted,
        },
    };
    Ok(build_messages(&ctx))
}

pub async fn render_page(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return ApiError::MethodNotAllowed { allow: "GET, POST" }.into_response();
    }
    let Some(llm) = state.ready_llm() else {
        return ApiError::NotReady.into_response();
    };
    let cookie = crate::request::session_cookie(&headers);
    let lease = state.store.open_session(cookie.as_deref());
    let inbound = Inbound::parse(&method, &uri, &headers, &body);
    let result = render(&state, llm, lease.id(), inbound).await;
    finish(&state, &lease, result)
}

async fn render(
    state: &AppState,
    llm: Arc<dyn LlmClient>,
    id: &SessionId,
    inbound: Inbound,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let runtime = state.runtime();
    let Inbound { call, branch } = inbound;
    state.store.check_write_target(id, branch.as_ref())?;

    let messages = prompt_messages(state, id, PromptMode::Page, &call, branch.as_ref(), &runtime)?;
    let result = llm.generate(&messages).await.map_err(|e| {
        tracing::error!(session_id = %id, path = %call.path, error_kind = e.error_kind(), error = %e, "page render failed");
        ApiError::Upstream(e.to_string())
    })?;

    let html = normalize_html_response(&result.html);
    let request = RequestInfo {
        method: call.method,
        path: call.path,
        query: call.query,
        body: call.body,
        instructions: None,
    };
    let duration_ms = elapsed_ms(started);
    let draft = EntryDraft::html(request, html.clone())
        .with_duration_ms(duration_ms)
        .with_brief(runtime.brief().map(String::from), runtime.brief_attachments.clone())
        .with_llm(llm.llm_info())
        .with_usage(result.usage)
        .with_reasoning(result.reasoning);
    let entry = state.store.append_history_entry(id, draft, branch.as_ref())?;
    tracing::info!(session_id = %id, entry_id = %entry.id, duration_ms, "page rendered");

    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        html,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ready_state, state, TestApp};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use mirage_core::history::EntryKind;
    use mirage_core::provider::ChatRole;
    use mirage_llm::{MockLlmClient, MockReply};

    #[tokio::test]
    async fn renders_page_and_records_entry() {
        let llm = Arc::new(MockLlmClient::always(
            "Here you go:\n<!DOCTYPE html><html><body>Todos</body></html>",
        ));
        let app = TestApp::new(ready_state(llm.clone()));

        let (status, headers, body) = app
            .send(Request::get("/todos?page=2").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<!DOCTYPE html><html><body>Todos</body></html>");
        assert!(headers[header::SET_COOKIE].to_str().unwrap().starts_with("sid="));

        let sid = TestApp::session_from(&headers);
        let history = app.state.store.get_history(&sid).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry_kind, EntryKind::Html);
        assert_eq!(history[0].request.query["page"], "2");
        assert_eq!(history[0].llm.as_ref().unwrap().model, "mock-model");
        assert_eq!(
            app.state.store.get_prev_html(&sid, None).unwrap(),
            "<!DOCTYPE html><html><body>Todos</body></html>"
        );

        let (_, _, _) = app
            .send(
                Request::get("/done")
                    .header(header::COOKIE, format!("sid={sid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        let messages = llm.last_messages().unwrap();
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages.iter().any(|m| m.content.contains("/todos")));
        assert_eq!(app.state.store.get_history(&sid).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn not_ready_without_brief_or_model() {
        let app = TestApp::new(state());
        let (status, _, body) = app.send(Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not ready");
        assert_eq!(app.state.store.session_count(), 0);
    }

    #[tokio::test]
    async fn model_failure_appends_nothing() {
        let llm = Arc::new(MockLlmClient::new(vec![MockReply::Error(
            mirage_core::ProviderError::NetworkError("reset".into()),
        )]));
        let app = TestApp::new(ready_state(llm));
        let (status, headers, body) = app.send(Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "network error: reset");
        let sid = TestApp::session_from(&headers);
        assert!(app.state.store.get_history(&sid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_not_allowed() {
        let app = TestApp::new(state());
        let (status, headers, _) = app
            .send(Request::delete("/todos").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(headers[header::ALLOW], "GET, POST");
    }
}
