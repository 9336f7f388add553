use anyhow::{Context, Result};
use parley_core::providers::mask_secret;
use parley_core::{
    CacheConfig, DisambiguationPrompts, LlmParams, RetryPolicy, RoutingMode, RuntimeError,
    SelectionThresholds,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub channels: ChannelsConfig,
    pub routing_repository: RoutingRepositoryConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub llm: Option<LlmSection>,
    #[serde(default)]
    pub disambiguation: DisambiguationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub state: StateConfig,
}

// ── Channels ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSource {
    /// Channels listed in this file
    #[default]
    Static,
    /// Channels declared by the routing repository itself
    Routing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub source: ChannelSource,
    #[serde(default)]
    pub entries: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

// ── Routing repository ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepositoryKind {
    #[serde(alias = "api")]
    Api,
    #[serde(alias = "file")]
    File,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RoutingRepositoryConfig {
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    /// Required for API
    #[serde(default)]
    pub base_url: Option<String>,
    /// Required for FILE: a definition file or a directory of them
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub subset: Option<String>,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_repository_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for RoutingRepositoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRepositoryConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("file_name", &self.file_name)
            .field("subset", &self.subset)
            .field("token", &mask_secret(&self.token))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_repository_timeout() -> u64 {
    10
}

// ── Cache ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_staleness")]
    pub max_staleness_secs: u64,
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cache_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_ttl() -> u64 {
    300
}
fn default_max_staleness() -> u64 {
    3600
}
fn default_capacity() -> usize {
    1024
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_cache_backoff() -> u64 {
    200
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            max_staleness_secs: default_max_staleness(),
            strict: false,
            capacity: default_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            retry_backoff_ms: default_cache_backoff(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            max_staleness: Duration::from_secs(self.max_staleness_secs),
            strict: self.strict,
            capacity: self.capacity,
            retry: RetryPolicy::once(Duration::from_millis(self.retry_backoff_ms)),
        }
    }
}

// ── Router and classifier ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// EXPLICIT only serves explicit channels; LLM serves both modes
    #[serde(rename = "type", default = "default_router")]
    pub kind: RoutingMode,
}

fn default_router() -> RoutingMode {
    RoutingMode::Explicit
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            kind: default_router(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[default]
    Llm,
    Keyword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(rename = "type", default)]
    pub kind: ClassifierKind,
    #[serde(flatten)]
    pub thresholds: SelectionThresholds,
    #[serde(default = "default_classifier_history")]
    pub history_limit: usize,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_classifier_history() -> usize {
    20
}
fn default_retry_backoff() -> u64 {
    250
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::default(),
            thresholds: SelectionThresholds::default(),
            history_limit: default_classifier_history(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Classifier model, with optional failover models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(flatten)]
    pub params: LlmParams,
    #[serde(default)]
    pub fallbacks: Vec<LlmParams>,
}

// ── Disambiguation ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisambiguationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_classifier_history")]
    pub history_limit: usize,
    #[serde(default)]
    pub prompts: DisambiguationPrompts,
    /// Dedicated model; required when enabled
    #[serde(default)]
    pub llm: Option<LlmParams>,
}

fn default_max_rounds() -> u32 {
    2
}

impl Default for DisambiguationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rounds: default_max_rounds(),
            history_limit: default_classifier_history(),
            prompts: DisambiguationPrompts::default(),
            llm: None,
        }
    }
}

// ── Dispatch ────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per HTTP request; the turn deadline bounds the whole dispatch
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    /// Bearer token for agents without their own entry
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub agents: Vec<AgentTokenEntry>,
}

impl std::fmt::Debug for DispatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchConfig")
            .field("timeout_secs", &self.timeout_secs)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .field("token", &mask_secret(&self.token))
            .field("agents", &self.agents)
            .finish()
    }
}

fn default_dispatch_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    500
}
fn default_max_polls() -> u32 {
    120
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            token: String::new(),
            agents: vec![],
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AgentTokenEntry {
    pub id: String,
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for AgentTokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTokenEntry")
            .field("id", &self.id)
            .field("token", &mask_secret(&self.token))
            .finish()
    }
}

// ── Conversation and state ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_deadline")]
    pub default_deadline_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_conversation_ttl")]
    pub ttl_secs: u64,
}

fn default_deadline() -> u64 {
    60
}
fn default_history_limit() -> usize {
    50
}
fn default_dedup_window() -> usize {
    64
}
fn default_conversation_ttl() -> u64 {
    24 * 3600
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            default_deadline_secs: default_deadline(),
            history_limit: default_history_limit(),
            dedup_window: default_dedup_window(),
            ttl_secs: default_conversation_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.parley/state.db".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            db_path: default_db_path(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}

impl ParleyConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Enforce config file permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                // Refuse to start if group or other can read (mode & 0o077 != 0)
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `parley init` first.",
                path.display()
            )
        })?;

        warn_hardcoded_secrets(&content);

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        Ok(config)
    }

    /// Structural checks that need no network or files.
    /// LLM credentials are checked when the providers are built.
    pub fn validate(&self) -> parley_core::Result<()> {
        let repo = &self.routing_repository;
        match repo.kind {
            RepositoryKind::Api if repo.base_url.as_deref().is_none_or(|u| u.trim().is_empty()) => {
                return Err(RuntimeError::configuration(
                    "routing_repository: base_url is required for type API",
                ));
            }
            RepositoryKind::File if repo.file_name.as_deref().is_none_or(|f| f.trim().is_empty()) => {
                return Err(RuntimeError::configuration(
                    "routing_repository: file_name is required for type FILE",
                ));
            }
            _ => {}
        }

        if self.cache.ttl_secs == 0 {
            return Err(RuntimeError::configuration("cache: ttl_secs must be positive"));
        }
        if self.cache.max_staleness_secs < self.cache.ttl_secs {
            return Err(RuntimeError::configuration(
                "cache: max_staleness_secs must not be shorter than ttl_secs",
            ));
        }
        if self.cache.capacity == 0 {
            return Err(RuntimeError::configuration("cache: capacity must be positive"));
        }

        let t = &self.classifier.thresholds;
        for (name, value) in [
            ("min_confidence", t.min_confidence),
            ("min_margin", t.min_margin),
            ("candidate_floor", t.candidate_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RuntimeError::configuration(format!(
                    "classifier: {} {} out of range 0.0..=1.0",
                    name, value
                )));
            }
        }

        if self.router.kind == RoutingMode::Llm
            && self.classifier.kind == ClassifierKind::Llm
            && self.llm.is_none()
        {
            return Err(RuntimeError::configuration(
                "router type LLM with an llm classifier requires an [llm] section",
            ));
        }

        if self.disambiguation.enabled {
            if self.disambiguation.llm.is_none() {
                return Err(RuntimeError::configuration(
                    "disambiguation is enabled but [disambiguation.llm] is missing",
                ));
            }
            if self.disambiguation.max_rounds == 0 {
                return Err(RuntimeError::configuration(
                    "disambiguation: max_rounds must be at least 1",
                ));
            }
        }

        if self.conversation.history_limit == 0 || self.conversation.dedup_window == 0 {
            return Err(RuntimeError::configuration(
                "conversation: history_limit and dedup_window must be positive",
            ));
        }
        if self.conversation.default_deadline_secs == 0 {
            return Err(RuntimeError::configuration(
                "conversation: default_deadline_secs must be positive",
            ));
        }

        if self.channels.source == ChannelSource::Static && self.channels.entries.is_empty() {
            warn!("No channels configured under [[channels.entries]]; every turn will fail");
        }
        for entry in &self.channels.entries {
            if entry.id.trim().is_empty() || entry.tenant_id.trim().is_empty() {
                return Err(RuntimeError::configuration(
                    "channels: every entry needs an id and a tenant_id",
                ));
            }
        }

        if self.state.backend == StateBackend::Sqlite && self.state.db_path.trim().is_empty() {
            return Err(RuntimeError::configuration("state: db_path is required for sqlite"));
        }
        Ok(())
    }
}

/// Warn about literal credentials; `${VAR}` references are fine
fn warn_hardcoded_secrets(raw: &str) {
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if matches!(key, "api_key" | "token") && !value.is_empty() && !value.contains("${") {
            warn!(
                "A {} is hardcoded in the config file. For security, use environment variables: {} = \"${{OPENAI_API_KEY}}\"",
                key, key
            );
        }
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "PARLEY_LLM_API_KEY",
    "PARLEY_DISAMBIGUATION_API_KEY",
    "PARLEY_FALLBACK_API_KEY",
    "PARLEY_ROUTING_TOKEN",
    "PARLEY_AGENT_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len; // Skip past the expanded value
    }
    result
}
