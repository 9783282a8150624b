//! Router harness shared by the handler tests.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use mirage_core::clock::{ManualClock, SequentialIds};
use mirage_core::history::ImageGenProvider;
use mirage_core::ids::SessionId;
use mirage_llm::{MockImageClient, MockLlmClient};
use mirage_store::{ImageCache, SessionStore, StoreConfig};
use serde_json::Value;
use tower::ServiceExt;

use crate::server::{build_router, AppState, ImageSettings, RuntimeOptions};
use crate::request::SESSION_COOKIE;

/// Fresh state with no model configured.
pub fn state() -> AppState {
    let store = SessionStore::new(
        StoreConfig::default(),
        Arc::new(ManualClock::epoch()),
        Arc::new(SequentialIds::new()),
    );
    AppState::new(Arc::new(store), Arc::new(ImageCache::new()), RuntimeOptions::default())
}

/// State whose model is `llm` and whose brief is set, so pages render.
pub fn ready_state(llm: Arc<MockLlmClient>) -> AppState {
    let state = state().with_llm(llm);
    state.runtime.write().brief = Some("A todo app".into());
    state
}

pub fn image_state(client: Arc<MockImageClient>, api_key: Option<&str>) -> AppState {
    let settings = ImageSettings {
        enabled: true,
        provider: ImageGenProvider::Openai,
        model_id: "gpt-image-1".into(),
        api_key: api_key.map(String::from),
        llm_provider: None,
        llm_api_key: None,
    };
    state().with_image_gen(client, settings)
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub fn new(state: AppState) -> Self {
        let router = build_router(state.clone());
        Self { state, router }
    }

    /// Send one request; JSON bodies are decoded, anything else comes back
    /// as a JSON string.
    pub async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, headers, body)
    }

    /// The session id a response's `Set-Cookie` assigned.
    pub fn session_from(headers: &HeaderMap) -> SessionId {
        let cookie = headers[header::SET_COOKIE].to_str().unwrap();
        let value = cookie
            .split(';')
            .next()
            .and_then(|pair| pair.strip_prefix(&format!("{SESSION_COOKIE}=")))
            .unwrap();
        SessionId::from_raw(value)
    }
}
