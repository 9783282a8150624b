//! Layered configuration: compiled defaults, then `~/.mirage/config.json`
//! (or `--config`), then `MIRAGE_*` environment variables, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use mirage_core::history::ImageGenProvider;
use mirage_core::provider::{ModelProvider, ReasoningMode};
use mirage_llm::ClientSettings;
use mirage_server::{ImageSettings, RuntimeOptions, ServerConfig};
use mirage_store::StoreConfig;
use mirage_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "MIRAGE_";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub runtime: RuntimeSettings,
    pub provider: ProviderSettings,
    pub image_generation: ImageGenSettings,
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub brief: Option<String>,
    pub history_limit: usize,
    /// 0 disables the byte budget.
    pub history_max_bytes: usize,
    /// Idle seconds before a session is evicted; unset keeps sessions until
    /// the cap pushes them out.
    pub session_ttl_secs: Option<u64>,
    pub session_cap: usize,
    pub sweep_interval_secs: u64,
    pub include_instruction_panel: bool,
    pub query_timeout_secs: Option<u64>,
    pub generated_images_dir: Option<PathBuf>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            brief: None,
            history_limit: 30,
            history_max_bytes: 200_000,
            session_ttl_secs: None,
            session_cap: 200,
            sweep_interval_secs: 60,
            include_instruction_panel: true,
            query_timeout_secs: None,
            generated_images_dir: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub provider: ModelProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_output_tokens: u32,
    pub reasoning_mode: ReasoningMode,
    pub reasoning_tokens: Option<i64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Openai,
            model: "gpt-4.1-mini".into(),
            api_key: None,
            base_url: None,
            max_output_tokens: 16_000,
            reasoning_mode: ReasoningMode::Default,
            reasoning_tokens: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenSettings {
    pub enabled: bool,
    pub provider: ImageGenProvider,
    pub model_id: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for ImageGenSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ImageGenProvider::Openai,
            model_id: "gpt-image-1".into(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Resolve the default config file path (`~/.mirage/config.json`).
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".mirage").join("config.json")
}

impl AppConfig {
    /// Defaults, then the JSON file at `path` if it exists, then `MIRAGE_*`
    /// variables (`MIRAGE_RUNTIME__HISTORY_LIMIT=10`).
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            sweep_interval: Duration::from_secs(self.runtime.sweep_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            session_ttl: self.runtime.session_ttl_secs.map(Duration::from_secs),
            session_cap: self.runtime.session_cap,
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            brief: self.runtime.brief.clone(),
            brief_attachments: Vec::new(),
            history_limit: self.runtime.history_limit.max(1),
            history_max_bytes: self.runtime.history_max_bytes,
            include_instruction_panel: self.runtime.include_instruction_panel,
            query_timeout: self.runtime.query_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Client settings, or `None` when no API key is configured.
    pub fn client_settings(&self) -> Option<ClientSettings> {
        let api_key = non_blank(self.provider.api_key.as_deref())?;
        Some(ClientSettings {
            provider: self.provider.provider,
            model: self.provider.model.clone(),
            api_key: api_key.to_string(),
            base_url: self.provider.base_url.clone(),
            max_output_tokens: self.provider.max_output_tokens,
            reasoning_mode: self.provider.reasoning_mode,
            reasoning_tokens: self.provider.reasoning_tokens,
            request_timeout: Some(Duration::from_secs(self.server.request_timeout_secs)),
        })
    }

    pub fn image_settings(&self) -> ImageSettings {
        ImageSettings {
            enabled: self.image_generation.enabled,
            provider: self.image_generation.provider,
            model_id: self.image_generation.model_id.clone(),
            api_key: non_blank(self.image_generation.api_key.as_deref()).map(String::from),
            llm_provider: Some(self.provider.provider),
            llm_api_key: non_blank(self.provider.api_key.as_deref()).map(String::from),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
