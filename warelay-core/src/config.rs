// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates ranges and provides sensible defaults for every optional field
use crate::backoff::BackoffConfig;
use crate::paths;
use crate::phone::DEFAULT_LOCAL_PREFIX;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub reconnect: BackoffConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

// ─── CompletionConfig ───────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Absent keys are tolerated here and fail at the first completion call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Per-request timeout; 0 waits forever
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Custom Debug impl to redact api_key
impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "llama3-8b-8192".to_string()
}

fn default_temperature() -> f32 {
    0.5
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    1.0
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_system_prompt() -> String {
    "You are a friendly, knowledgeable assistant chatting with people over instant messages. \
     Answer helpfully and concisely, and reply in the language the user writes in."
        .to_string()
}

// ─── RelayConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Ignore group conversations entirely
    #[serde(default)]
    pub direct_only: bool,
    /// Sent instead of silence when the completion service fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reply: Option<String>,
    /// Relay every message of a batched upsert instead of only the first
    #[serde(default)]
    pub process_whole_batch: bool,
}

// ─── SessionConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_dir")]
    pub dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: default_session_dir(),
        }
    }
}

fn default_session_dir() -> String {
    "./session".to_string()
}

// ─── PairingConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Country prefix that replaces a leading "0"
    #[serde(default = "default_local_prefix")]
    pub local_prefix: String,
    /// Overrides the built-in country calling code table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_prefixes: Option<Vec<String>>,
    /// Wait after connecting before asking for a pairing code
    #[serde(default = "default_code_delay_ms")]
    pub code_delay_ms: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            local_prefix: default_local_prefix(),
            allowed_prefixes: None,
            code_delay_ms: default_code_delay_ms(),
        }
    }
}

fn default_local_prefix() -> String {
    DEFAULT_LOCAL_PREFIX.to_string()
}

fn default_code_delay_ms() -> u64 {
    5_000
}

// ─── TransportConfig ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Sidecar executable bridging the chat network. No default: the
    /// workspace does not ship one.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Browser identity triple: platform, browser, version
    #[serde(default = "default_browser")]
    pub browser: Vec<String>,
    #[serde(default = "default_true")]
    pub mark_online_on_connect: bool,
    #[serde(default = "default_true")]
    pub sync_full_history: bool,
    /// Messages kept for retry lookups
    #[serde(default = "default_message_store_capacity")]
    pub message_store_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            browser: default_browser(),
            mark_online_on_connect: true,
            sync_full_history: true,
            message_store_capacity: default_message_store_capacity(),
        }
    }
}

fn default_browser() -> Vec<String> {
    vec!["Windows".to_string(), "Firefox".to_string(), String::new()]
}

fn default_true() -> bool {
    true
}

fn default_message_store_capacity() -> usize {
    1000
}

/// Accepts 1/0, true/false, yes/no, on/off
fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got: {}", name, other),
    }
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. explicit path (from --config)
    /// 2. WARELAY_CONFIG_PATH env var (if set)
    /// 3. ./config.toml (current directory - for development)
    /// 4. ~/.config/warelay/config.toml (XDG config dir)
    fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(env_path) = std::env::var("WARELAY_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from a TOML file with environment variable overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file(explicit) {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.session.dir = paths::expand_tilde(&config.session.dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides; `lookup` is injectable for tests
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = lookup("GROQ_API_KEY") {
            self.completion.api_key = Some(val);
        }
        // Generic name wins over the provider-specific one
        if let Some(val) = lookup("COMPLETION_API_KEY") {
            self.completion.api_key = Some(val);
        }
        if let Some(val) = lookup("COMPLETION_BASE_URL") {
            self.completion.base_url = val;
        }
        if let Some(val) = lookup("COMPLETION_MODEL") {
            self.completion.model = val;
        }
        if let Some(val) = lookup("DIRECT_ONLY") {
            self.relay.direct_only = parse_flag("DIRECT_ONLY", &val)?;
        }
        if let Some(val) = lookup("FALLBACK_REPLY") {
            self.relay.fallback_reply = Some(val);
        }
        if let Some(val) = lookup("SESSION_DIR") {
            self.session.dir = val;
        }
        if let Some(val) = lookup("PAIRING_LOCAL_PREFIX") {
            self.pairing.local_prefix = val;
        }
        if let Some(val) = lookup("SIDECAR_COMMAND") {
            self.transport.command = val;
        }
        if let Some(val) = lookup("MAX_RESTARTS") {
            self.reconnect.max_restarts = val
                .parse()
                .with_context(|| format!("MAX_RESTARTS must be a valid number, got: {}", val))?;
        }

        // Blank keys count as missing
        if self
            .completion
            .api_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            self.completion.api_key = None;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.completion;
        if !(0.0..=2.0).contains(&c.temperature) {
            anyhow::bail!(
                "completion.temperature must be between 0 and 2, got {}",
                c.temperature
            );
        }
        if !(0.0..=1.0).contains(&c.top_p) {
            anyhow::bail!("completion.top_p must be between 0 and 1, got {}", c.top_p);
        }
        if c.max_tokens == 0 {
            anyhow::bail!("completion.max_tokens must be greater than 0");
        }
        if c.base_url.trim().is_empty() {
            anyhow::bail!("completion.base_url is required");
        }
        if self.session.dir.trim().is_empty() {
            anyhow::bail!("session.dir is required (set in config.toml or SESSION_DIR env var)");
        }
        if !self.pairing.local_prefix.chars().all(|ch| ch.is_ascii_digit()) {
            anyhow::bail!(
                "pairing.local_prefix must contain digits only, got: {}",
                self.pairing.local_prefix
            );
        }
        if self.transport.command.trim().is_empty() {
            anyhow::bail!(
                "transport.command is required: set [transport] command (or SIDECAR_COMMAND) \
                 to the sidecar process that bridges the chat network (see README.md)"
            );
        }
        if self.transport.message_store_capacity == 0 {
            anyhow::bail!("transport.message_store_capacity must be greater than 0");
        }
        Ok(())
    }
}
