use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use mirage_core::history::{BriefAttachment, ImageGenProvider};
use mirage_core::provider::{ImageGenClient, LlmClient, ModelProvider};
use mirage_store::images::key_from_file_name;
use mirage_store::{EvictionSweeper, ImageCache, SessionStore, SnapshotRuntime};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::{admin, render, rest};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Settings the admin side may change while the server runs.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub brief: Option<String>,
    pub brief_attachments: Vec<BriefAttachment>,
    pub history_limit: usize,
    /// 0 means unlimited.
    pub history_max_bytes: usize,
    pub include_instruction_panel: bool,
    pub query_timeout: Option<Duration>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            brief: None,
            brief_attachments: Vec::new(),
            history_limit: 30,
            history_max_bytes: 200_000,
            include_instruction_panel: true,
            query_timeout: None,
        }
    }
}

impl RuntimeOptions {
    pub fn brief(&self) -> Option<&str> {
        self.brief.as_deref().map(str::trim).filter(|b| !b.is_empty())
    }

    pub fn snapshot_runtime(&self) -> SnapshotRuntime {
        SnapshotRuntime {
            history_limit: self.history_limit,
            history_max_bytes: self.history_max_bytes,
            include_instruction_panel: self.include_instruction_panel,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ImageSettings {
    pub enabled: bool,
    pub provider: ImageGenProvider,
    pub model_id: String,
    pub api_key: Option<String>,
    /// Text provider and its key, reused when it is the same vendor.
    pub llm_provider: Option<ModelProvider>,
    pub llm_api_key: Option<String>,
}

impl ImageSettings {
    /// The image key when set, else the text provider's key if both use the
    /// same vendor.
    pub fn resolve_api_key(&self) -> Option<&str> {
        let own = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
        own.or_else(|| {
            let same_vendor = self
                .llm_provider
                .is_some_and(|p| p.as_str() == self.provider.as_str());
            if !same_vendor {
                return None;
            }
            self.llm_api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
        })
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub images: Arc<ImageCache>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub image_gen: Option<Arc<dyn ImageGenClient>>,
    pub runtime: Arc<RwLock<RuntimeOptions>>,
    pub image_settings: Arc<ImageSettings>,
}

impl AppState {
    pub fn new(store: Arc<SessionStore>, images: Arc<ImageCache>, runtime: RuntimeOptions) -> Self {
        Self {
            store,
            images,
            llm: None,
            image_gen: None,
            runtime: Arc::new(RwLock::new(runtime)),
            image_settings: Arc::new(ImageSettings::default()),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_image_gen(mut self, client: Arc<dyn ImageGenClient>, settings: ImageSettings) -> Self {
        self.image_gen = Some(client);
        self.image_settings = Arc::new(settings);
        self
    }

    pub fn runtime(&self) -> RuntimeOptions {
        self.runtime.read().clone()
    }

    /// The model client, when a client is configured and a brief is set.
    pub fn ready_llm(&self) -> Option<Arc<dyn LlmClient>> {
        let has_brief = self.runtime.read().brief().is_some();
        self.llm.clone().filter(|_| has_brief)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generated-images/{file}", get(image_file_handler))
        .route("/rest_api/mutation/{*path}", any(rest::mutation))
        .route("/rest_api/query/{*path}", any(rest::query))
        .route("/rest_api/image/generate", any(rest::generate_image))
        .route("/rest_api/{*path}", any(rest::unknown))
        .route("/__mirage/sessions", get(admin::list_sessions))
        .route("/__mirage/sessions/{sid}/fork", get(admin::fork_status))
        .route("/__mirage/sessions/{sid}/history.json", get(admin::export_history))
        .route("/__mirage/sessions/{sid}/history", post(admin::import_history))
        .route("/__mirage/forks", post(admin::start_fork))
        .route("/__mirage/forks/{fork_id}/commit", post(admin::commit_fork))
        .route("/__mirage/forks/{fork_id}/discard", post(admin::discard_fork))
        .fallback(render::render_page)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let cancel = CancellationToken::new();
    let sweeper = EvictionSweeper::spawn(Arc::clone(&state.store), config.sweep_interval, cancel.child_token());

    let router = build_router(state).layer(TimeoutLayer::new(config.request_timeout));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "mirage server started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        server,
        sweeper,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running;
/// call [`shutdown`](Self::shutdown) to stop it.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sweeper: EvictionSweeper,
}

impl ServerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting connections, drain in-flight requests and stop the sweeper.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
        self.sweeper.shutdown().await;
        tracing::info!("mirage server stopped");
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.store.session_count(),
    }))
}

async fn image_file_handler(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let Some(key) = key_from_file_name(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(image) = state.images.get(key).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let content_type =
        HeaderValue::from_str(&image.mime_type).unwrap_or(HeaderValue::from_static("image/png"));
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=31536000, immutable")),
        ],
        image.bytes.as_ref().clone(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{state, TestApp};
    use axum::body::Body;
    use axum::http::Request;

    #[test]
    fn image_key_falls_back_to_matching_text_provider() {
        let mut settings = ImageSettings {
            enabled: true,
            provider: ImageGenProvider::Openai,
            model_id: "gpt-image-1".into(),
            api_key: None,
            llm_provider: Some(ModelProvider::Openai),
            llm_api_key: Some("sk-text".into()),
        };
        assert_eq!(settings.resolve_api_key(), Some("sk-text"));
        settings.llm_provider = Some(ModelProvider::Anthropic);
        assert_eq!(settings.resolve_api_key(), None);
        settings.api_key = Some(" sk-image ".into());
        assert_eq!(settings.resolve_api_key(), Some("sk-image"));
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let app = TestApp::new(state());
        app.state.store.open_session(None);
        let (status, _, body) = app.send(Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 1);
    }

    #[tokio::test]
    async fn unknown_image_file_is_404() {
        let app = TestApp::new(state());
        let (status, _, _) = app
            .send(Request::get("/generated-images/nope.png").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_image_written_by_an_earlier_process() {
        let dir = tempfile::tempdir().unwrap();
        let key = "ab".repeat(32);
        ImageCache::with_dir(dir.path())
            .insert(&key, vec![1, 2, 3], "image/png", chrono::Utc::now())
            .await
            .unwrap();

        let mut state = state();
        state.images = Arc::new(ImageCache::with_dir(dir.path()));
        let app = TestApp::new(state);
        let (status, headers, _) = app
            .send(Request::get(format!("/generated-images/{key}.png")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CACHE_CONTROL].to_str().unwrap().contains("immutable"));
    }

    #[tokio::test]
    async fn server_starts_and_shuts_down() {
        let config = ServerConfig {
            port: 0, // Random port
            ..Default::default()
        };
        let handle = start(config, state()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        handle.shutdown().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
