//! Virtual REST namespaces served to generated pages.
//!
//! - `mutation/*` is a write-ahead log: the call is recorded and
//!   acknowledged without asking the model.
//! - `query/*` asks the model for JSON and records the outcome, good or bad.
//! - `image/generate` produces (or reuses) a content-addressed image and
//!   registers it with the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mirage_core::errors::ProviderError;
use mirage_core::history::{
    EntryDraft, GeneratedImage, ImageRatio, RequestInfo, RestKind, RestMetadata,
};
use mirage_core::ids::{ImageId, SessionId};
use mirage_core::provider::{ImageGenClient, ImageRequest, LlmClient};
use mirage_llm::{parse_json_response, PromptMode};
use mirage_store::images::cache_key;
use mirage_store::{QueryOutcome, RestCall, SessionLease};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::render::prompt_messages;
use crate::request::{session_cookie, with_session_cookie, Inbound};
use crate::server::AppState;

/// Turn a handler result into a response, adding the session cookie when
/// this request created the session.
pub(crate) fn finish(state: &AppState, lease: &SessionLease, result: Result<Response, ApiError>) -> Response {
    let response = result.unwrap_or_else(IntoResponse::into_response);
    with_session_cookie(response, lease, state.store.config().session_ttl)
}

fn no_store(body: Value) -> Response {
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn rest_metadata(kind: RestKind, call: &RestCall) -> RestMetadata {
    RestMetadata {
        kind,
        request: RequestInfo {
            method: call.method.clone(),
            path: call.path.clone(),
            query: call.query.clone(),
            body: call.body.clone(),
            instructions: None,
        },
        response: None,
        raw_response: None,
        ok: None,
        error: None,
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Mutation ────────────────────────────────────────────────────────────────

pub async fn mutation(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        return ApiError::MethodNotAllowed { allow: "POST, PUT, PATCH" }.into_response();
    }
    if state.ready_llm().is_none() {
        return ApiError::NotReady.into_response();
    }
    let started = Instant::now();
    let lease = state.store.open_session(session_cookie(&headers).as_deref());
    let Inbound { call, branch } = Inbound::parse(&method, &uri, &headers, &body);

    let mut meta = rest_metadata(RestKind::Mutation, &call);
    meta.response = Some(json!({"success": true}));
    let draft = EntryDraft::rest(meta).with_duration_ms(elapsed_ms(started));
    let result = state
        .store
        .record_mutation(lease.id(), &call, draft, branch.as_ref())
        .map(|(record, _)| {
            tracing::debug!(session_id = %lease.id(), record_id = %record.id, path = %call.path, "recorded REST mutation");
            no_store(json!({"success": true}))
        })
        .map_err(ApiError::from);
    finish(&state, &lease, result)
}

// ── Query ───────────────────────────────────────────────────────────────────

pub async fn query(
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
    let lease = state.store.open_session(session_cookie(&headers).as_deref());
    let inbound = Inbound::parse(&method, &uri, &headers, &body);
    let result = answer_query(&state, llm, lease.id(), inbound).await;
    finish(&state, &lease, result)
}

async fn answer_query(
    state: &AppState,
    llm: Arc<dyn LlmClient>,
    id: &SessionId,
    inbound: Inbound,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let runtime = state.runtime();
    let Inbound { call, branch } = inbound;
    let branch = branch.as_ref();
    state.store.check_write_target(id, branch)?;

    let messages = prompt_messages(state, id, PromptMode::JsonQuery, &call, branch, &runtime)?;
    let generated = match runtime.query_timeout {
        Some(limit) => tokio::time::timeout(limit, llm.generate(&messages))
            .await
            .unwrap_or(Err(ProviderError::Timeout(limit))),
        None => llm.generate(&messages).await,
    };

    let result = match generated {
        Ok(result) => result,
        Err(e) => {
            let message = e.to_string();
            tracing::error!(session_id = %id, path = %call.path, error_kind = e.error_kind(), error = %message, "REST query failed");
            let outcome = QueryOutcome {
                ok: false,
                response: Value::Null,
                raw_response: String::new(),
                error: Some(message.clone()),
            };
            let mut meta = rest_metadata(RestKind::Query, &call);
            meta.ok = Some(false);
            meta.error = Some(message.clone());
            let draft = EntryDraft::rest(meta)
                .with_duration_ms(elapsed_ms(started))
                .with_llm(llm.llm_info());
            state.store.record_query(id, &call, outcome, draft, branch)?;
            return Err(ApiError::Upstream(message));
        }
    };

    let raw = result.html.trim().to_string();
    let mut meta = rest_metadata(RestKind::Query, &call);
    meta.raw_response = Some(raw.clone());

    match parse_json_response(&raw) {
        Ok(parsed) => {
            meta.response = Some(parsed.clone());
            meta.ok = Some(true);
            let outcome = QueryOutcome {
                ok: true,
                response: parsed.clone(),
                raw_response: raw,
                error: None,
            };
            let draft = EntryDraft::rest(meta)
                .with_duration_ms(elapsed_ms(started))
                .with_llm(llm.llm_info())
                .with_usage(result.usage)
                .with_reasoning(result.reasoning);
            state.store.record_query(id, &call, outcome, draft, branch)?;
            tracing::debug!(session_id = %id, path = %call.path, "served REST query response");
            Ok(no_store(parsed))
        }
        Err(parse_error) => {
            tracing::warn!(session_id = %id, path = %call.path, error = %parse_error, "model returned invalid JSON for query");
            meta.ok = Some(false);
            meta.error = Some(parse_error.clone());
            let outcome = QueryOutcome {
                ok: false,
                response: Value::Null,
                raw_response: raw,
                error: Some(parse_error),
            };
            let draft = EntryDraft::rest(meta)
                .with_duration_ms(elapsed_ms(started))
                .with_llm(llm.llm_info())
                .with_usage(result.usage)
                .with_reasoning(result.reasoning);
            state.store.record_query(id, &call, outcome, draft, branch)?;
            Err(ApiError::InvalidModelJson)
        }
    }
}

// ── Image generation ────────────────────────────────────────────────────────

pub async fn generate_image(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return ApiError::MethodNotAllowed { allow: "POST" }.into_response();
    }
    let settings = Arc::clone(&state.image_settings);
    if !settings.enabled {
        return ApiError::ImageGenDisabled.into_response();
    }
    let inbound = Inbound::parse(&method, &uri, &headers, &body);
    let Some(prompt) = inbound
        .call
        .body
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
    else {
        return ApiError::MissingPrompt.into_response();
    };
    let ratio = ImageRatio::parse_or_default(inbound.call.body.get("ratio").and_then(Value::as_str));
    let Some(api_key) = settings.resolve_api_key().map(String::from) else {
        return ApiError::MissingApiKey.into_response();
    };
    let Some(client) = state.image_gen.clone() else {
        return ApiError::ImageGenUnavailable.into_response();
    };

    let lease = state.store.open_session(session_cookie(&headers).as_deref());
    let request = ImageRequest {
        prompt,
        ratio,
        model_id: settings.model_id.clone(),
        api_key,
    };
    let result = produce_image(&state, client, lease.id(), request, inbound).await;
    finish(&state, &lease, result)
}

async fn produce_image(
    state: &AppState,
    client: Arc<dyn ImageGenClient>,
    id: &SessionId,
    request: ImageRequest,
    inbound: Inbound,
) -> Result<Response, ApiError> {
    let provider = state.image_settings.provider;
    let key = cache_key(provider, &request.model_id, &request.prompt, request.ratio);

    let cached = match state.images.get(&key).await {
        Some(hit) => {
            tracing::debug!(session_id = %id, cache_key = %key, "image cache hit");
            hit
        }
        None => {
            let generated = client.generate_image(&request).await.map_err(|e| {
                tracing::error!(session_id = %id, cache_key = %key, error = %e, "image generation failed");
                ApiError::Upstream(e.to_string())
            })?;
            let image = state
                .images
                .insert(&key, generated.bytes, &generated.mime_type, state.store.now())
                .await?;
            tracing::info!(session_id = %id, cache_key = %key, "image generated");
            image
        }
    };

    let url = cached.url();
    let image = GeneratedImage {
        id: ImageId::new(),
        cache_key: key,
        url: url.clone(),
        prompt: request.prompt,
        ratio: request.ratio,
        provider,
        model_id: request.model_id,
        mime_type: cached.mime_type.clone(),
        base64: Some(cached.to_base64()),
        created_at: cached.created_at,
    };
    state
        .store
        .record_generated_image(id, image, inbound.branch.as_ref())?;
    Ok(no_store(json!({"url": url})))
}

pub async fn unknown() -> ApiError {
    ApiError::UnknownRestEndpoint
}
