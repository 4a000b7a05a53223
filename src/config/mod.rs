use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::error::InboxError;

/// Inbox configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub send: SendConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Stream subscription and reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Consecutive failed attempts before the stream gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Timeout for a single subscribe call in seconds
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

/// Conversation list cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a fetched conversation list stays fresh
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Timeout for the list call in seconds
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
}

/// Send pipeline and retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendConfig {
    /// Timeout for one delivery attempt in seconds
    #[serde(default = "default_send_timeout_seconds")]
    pub send_timeout_seconds: u64,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Retry ticker period in milliseconds (at most 2000)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long optimistic bookkeeping outlives a confirmed send
    #[serde(default = "default_confirmation_grace_ms")]
    pub confirmation_grace_ms: u64,
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
    #[serde(default = "default_upload_timeout_seconds")]
    pub upload_timeout_seconds: u64,
}

/// Stream deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Number of remembered identities before the oldest are evicted
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

/// In-memory message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_messages_per_conversation")]
    pub max_messages_per_conversation: usize,
}

/// Search defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Page size when the query does not set a limit; unbounded when unset
    #[serde(default)]
    pub default_limit: Option<usize>,
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_connect_timeout_seconds() -> u64 {
    15
}

fn default_ttl_seconds() -> u64 {
    30
}

fn default_fetch_timeout_seconds() -> u64 {
    15
}

fn default_send_timeout_seconds() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_confirmation_grace_ms() -> u64 {
    5_000
}

fn default_max_text_bytes() -> usize {
    64 * 1024
}

fn default_max_attachments() -> usize {
    10
}

fn default_max_attachment_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_upload_timeout_seconds() -> u64 {
    60
}

fn default_dedup_capacity() -> usize {
    2_000
}

fn default_max_messages_per_conversation() -> usize {
    1_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            send_timeout_seconds: default_send_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            confirmation_grace_ms: default_confirmation_grace_ms(),
            max_text_bytes: default_max_text_bytes(),
            max_attachments: default_max_attachments(),
            max_attachment_bytes: default_max_attachment_bytes(),
            upload_timeout_seconds: default_upload_timeout_seconds(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: default_max_messages_per_conversation(),
        }
    }
}

impl StreamConfig {
    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .reconnect_initial_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_max_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

impl SendConfig {
    /// Backoff after a failed attempt that had `attempt` earlier retries
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let ms = self
            .retry_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_ms);
        Duration::from_millis(ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn confirmation_grace(&self) -> Duration {
        Duration::from_millis(self.confirmation_grace_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }
}

impl InboxConfig {
    /// Reject values the workers cannot run with
    pub fn validate(&self) -> Result<(), InboxError> {
        if self.dedup.capacity == 0 {
            return Err(InboxError::Config("dedup.capacity must be > 0".into()));
        }
        if self.store.max_messages_per_conversation == 0 {
            return Err(InboxError::Config(
                "store.max_messages_per_conversation must be > 0".into(),
            ));
        }
        if self.send.tick_interval_ms == 0 || self.send.tick_interval_ms > 2_000 {
            return Err(InboxError::Config(
                "send.tick_interval_ms must be between 1 and 2000".into(),
            ));
        }
        if self.send.send_timeout_seconds == 0 || self.cache.fetch_timeout_seconds == 0 {
            return Err(InboxError::Config("network timeouts must be > 0".into()));
        }
        if self.stream.reconnect_initial_ms == 0
            || self.stream.reconnect_initial_ms > self.stream.reconnect_max_ms
        {
            return Err(InboxError::Config(
                "stream.reconnect_initial_ms must be > 0 and <= reconnect_max_ms".into(),
            ));
        }
        if self.search.default_limit == Some(0) {
            return Err(InboxError::Config("search.default_limit must be > 0".into()));
        }
        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("inbox-sync").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("inbox-sync")
                .join("config.toml"),
        );
        paths.push(home_dir.join(".inbox-sync.rc"));
    }

    paths
}

/// Load configuration from the first default path that exists
pub fn load_config() -> Result<InboxConfig, InboxError> {
    info!("Loading configuration from default paths");

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(InboxConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<InboxConfig, InboxError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| InboxError::Config(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

/// Parse and validate a TOML configuration document
pub fn parse_config(content: &str) -> Result<InboxConfig, InboxError> {
    let config: InboxConfig = toml::from_str(content)
        .map_err(|e| InboxError::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}
