use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use conclave_session::{CombineMode, ModelRef, ModelSelection, ReconnectPolicy, SessionConfig};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reconnect]
//                    max_retries = 3
//
//   env var:         CONCLAVE_RECONNECT__MAX_RETRIES=3   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub models: ModelsFileConfig,
}

/// Server endpoints (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

/// `[auth]`. The token usually comes from `CONCLAVE_AUTH__TOKEN` or `--token`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub token: Option<String>,
}

/// Reconnection backoff (`[reconnect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

/// `[session]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_creation_timeout_secs")]
    pub creation_timeout_secs: u64,
    #[serde(default = "default_max_cached_conversations")]
    pub max_cached_conversations: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            creation_timeout_secs: default_creation_timeout_secs(),
            max_cached_conversations: default_max_cached_conversations(),
        }
    }
}

/// Initial model selection (`[models]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelsFileConfig {
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub mode: CombineMode,
    #[serde(default)]
    pub reveal_intermediate: bool,
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_retries() -> u32 {
    8
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_creation_timeout_secs() -> u64 {
    30
}
fn default_max_cached_conversations() -> usize {
    32
}

/// Build a figment that layers: defaults → config.toml → CONCLAVE_* env vars.
///
///   `CONCLAVE_SERVER__WS_URL=wss://chat.example/ws`  →  `server.ws_url`
///   `CONCLAVE_MODELS__MODE=consensus`                →  `models.mode`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CONCLAVE_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub session: SessionConfig,
    pub selection: ModelSelection,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let r = &fc.reconnect;
        Self {
            ws_url: fc.server.ws_url.clone(),
            api_url: fc.server.api_url.clone(),
            token: fc.auth.token.clone().filter(|t| !t.is_empty()),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(r.initial_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms.max(r.initial_delay_ms)),
                backoff_factor: r.backoff_factor,
                jitter: r.jitter,
                max_retries: r.max_retries,
                handshake_timeout: Duration::from_secs(r.handshake_timeout_secs),
            },
            session: SessionConfig {
                creation_timeout: Duration::from_secs(fc.session.creation_timeout_secs),
                max_cached_conversations: fc.session.max_cached_conversations.max(1),
            },
            selection: ModelSelection::new(
                fc.models.default.iter().map(|m| ModelRef::new(m.as_str())),
                fc.models.mode,
            )
            .with_reveal_intermediate(fc.models.reveal_intermediate),
        }
    }

    /// Load `<data_dir>/config.toml` plus environment overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        Ok(Self::from_file(&effective_file_config(data_dir)?))
    }
}

pub fn effective_file_config(data_dir: &Path) -> Result<FileConfig> {
    let fc: FileConfig = load_config(data_dir)
        .extract()
        .context("Failed to load configuration")?;
    debug!(ws_url = %fc.server.ws_url, api_url = %fc.server.api_url, "configuration loaded");
    Ok(fc)
}

/// Effective configuration as TOML, with the token redacted.
pub fn render_toml(fc: &FileConfig) -> Result<String> {
    let mut fc = fc.clone();
    if fc.auth.token.is_some() {
        fc.auth.token = Some("<redacted>".to_string());
    }
    toml::to_string_pretty(&fc).context("Failed to render configuration")
}

/// Resolve and create the data directory (defaults to `~/.conclave`).
pub fn data_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    let data_dir = match custom_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("Could not find home directory")?
            .join(".conclave"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
    Ok(data_dir)
}
