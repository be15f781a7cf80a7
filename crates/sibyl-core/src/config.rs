use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8780;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (sibyl.toml + SIBYL_* env overrides).
///
/// Loaded exactly once at startup. Nothing reads process environment after
/// initialization — handlers see only this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SibylConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub autopost: AutopostConfig,
}

impl Default for SibylConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            model: ModelConfig::default(),
            vector: VectorConfig::default(),
            providers: ProvidersConfig::default(),
            auth: AuthConfig::default(),
            chat: ChatConfig::default(),
            autopost: AutopostConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Model identifiers for the two LLM roles. `judge` is the small model used
/// for quality scoring and memory extraction; defaults to `generation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_generation_model")]
    pub generation: String,
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
    pub judge: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            generation: default_generation_model(),
            embedding: default_embedding_model(),
            judge: None,
        }
    }
}

impl ModelConfig {
    pub fn judge_model(&self) -> &str {
        self.judge.as_deref().unwrap_or(&self.generation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Fixed embedding dimension. Vectors of any other width are rejected
    /// with a fatal DimensionMismatch.
    #[serde(default = "default_vector_dim")]
    pub dim: usize,
    /// Embedding timeout per batch.
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
    /// Vector search timeout.
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dim: default_vector_dim(),
            embed_timeout_ms: default_embed_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

/// OpenAI-compatible endpoint — used for embeddings and, when Anthropic is
/// not configured, generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

/// External auth provider (token → user id) plus the scheduler shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    /// Cache TTL for verified tokens.
    #[serde(default = "default_auth_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Shared secret for the X-Scheduler-Key header.
    #[serde(default)]
    pub scheduler_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            cache_ttl_secs: default_auth_cache_ttl_secs(),
            scheduler_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// Hard input budget for the composed context, in tokens.
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            first_token_timeout_ms: default_first_token_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            context_budget_tokens: default_context_budget_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopostConfig {
    /// Global kill switch — overrides every per-agent setting.
    #[serde(default)]
    pub enabled: bool,
    /// Pause between agents in a batch run.
    #[serde(default = "default_autopost_delay_seconds")]
    pub delay_seconds: u64,
}

impl Default for AutopostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_seconds: default_autopost_delay_seconds(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.sibyl/sibyl.db")
}
fn default_generation_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_vector_dim() -> usize {
    1536
}
fn default_embed_timeout_ms() -> u64 {
    5_000
}
fn default_search_timeout_ms() -> u64 {
    1_000
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_auth_cache_ttl_secs() -> u64 {
    300
}
fn default_first_token_timeout_ms() -> u64 {
    10_000
}
fn default_total_timeout_ms() -> u64 {
    90_000
}
fn default_context_budget_tokens() -> usize {
    6_000
}
fn default_autopost_delay_seconds() -> u64 {
    5
}

impl SibylConfig {
    /// Load config from a TOML file with SIBYL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.sibyl/sibyl.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SibylConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SIBYL_").split("_"))
            .extract()
            .map_err(|e| crate::error::SibylError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.sibyl/sibyl.toml")
}
