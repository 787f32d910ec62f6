use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (store.toml + STORE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub lease_lock: LeaseLockConfig,
}

impl StoreConfig {
    /// Load config from a TOML file with `STORE_` env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `./store.toml`
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.map(String::from).unwrap_or_else(|| "store.toml".to_string());

        let config: StoreConfig = Figment::from(figment::providers::Serialized::defaults(
            StoreConfig::default(),
        ))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("STORE_").split("_"))
        .extract()
        .map_err(|e| crate::error::StoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Where sessions/branches/locks are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file, or `:memory:` for an ephemeral store.
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

fn default_db_path() -> String {
    "sessions.db".to_string()
}

/// Reset-mode precedence configuration for the expiry policy (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// How a DM's identity collapses to a session key (spec §4.1).
    #[serde(default)]
    pub dm_scope: DmScope,
    /// `canonical -> ["<channel>:<peer>", ...]` aliases for identity
    /// resolution (spec §4.1 "Identity resolution").
    #[serde(default)]
    pub identity_links: std::collections::BTreeMap<String, Vec<String>>,
    /// Append `:thread:<id>` to keys for threaded conversations.
    #[serde(default = "bool_true")]
    pub use_thread_suffix: bool,
    /// Default reset behavior applied when no per-channel/per-conv-type
    /// override matches.
    #[serde(default)]
    pub reset: ResetConfig,
    /// Overrides keyed by conversation type (`dm`, `group`, `thread`).
    #[serde(default)]
    pub reset_by_type: std::collections::BTreeMap<String, ResetConfig>,
    /// Overrides keyed by channel name; takes precedence over `reset_by_type`.
    #[serde(default)]
    pub reset_by_channel: std::collections::BTreeMap<String, ResetConfig>,
    /// IANA timezone name used to compute `daily` reset boundaries.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            dm_scope: DmScope::default(),
            identity_links: Default::default(),
            use_thread_suffix: true,
            reset: ResetConfig::default(),
            reset_by_type: Default::default(),
            reset_by_channel: Default::default(),
            timezone: default_timezone(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// DM scoping mode (spec §4.1 "Key grammar").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    Main,
    #[default]
    PerPeer,
    PerChannelPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    #[default]
    Never,
    Idle,
    Daily,
    DailyIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResetConfig {
    #[serde(default)]
    pub mode: ResetMode,
    /// Hour of day (0-23, local to `ScopeConfig::timezone`) at which a
    /// `daily`/`daily_idle` session resets. Values outside `[0, 23]` default
    /// to 0.
    #[serde(default)]
    pub at_hour: i32,
    /// Minutes of inactivity after which an `idle`/`daily_idle` session
    /// resets. `<= 0` disables idle-based reset.
    #[serde(default)]
    pub idle_minutes: i64,
}

/// Compaction policy (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: CompactionStrategy,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub max_age_hours: i64,
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
    #[serde(default)]
    pub summary_prompt: String,
    #[serde(default = "bool_true")]
    pub preserve_system_messages: bool,
    #[serde(default = "bool_true")]
    pub preserve_important_messages: bool,
    /// Adaptive multi-stage chunking parameters; `None` disables the
    /// adaptive variant and callers use the plain strategies only.
    #[serde(default)]
    pub adaptive: Option<AdaptiveCompactionConfig>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: CompactionStrategy::default(),
            max_messages: default_max_messages(),
            max_tokens: default_max_tokens(),
            max_age_hours: 0,
            keep_last_n: default_keep_last_n(),
            summary_prompt: String::new(),
            preserve_system_messages: true,
            preserve_important_messages: true,
            adaptive: None,
        }
    }
}

fn default_max_messages() -> usize {
    200
}
fn default_max_tokens() -> usize {
    8000
}
fn default_keep_last_n() -> usize {
    20
}
fn bool_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    #[default]
    LastN,
    Summarize,
    Hybrid,
    ImportantOnly,
    TruncateOld,
}

/// Adaptive variant thresholds (spec §4.4 "Adaptive variant").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCompactionConfig {
    pub context_window_tokens: usize,
    #[serde(default = "default_base_chunk_ratio")]
    pub base_chunk_ratio: f64,
    #[serde(default = "default_min_chunk_ratio")]
    pub min_chunk_ratio: f64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    #[serde(default = "default_max_parts")]
    pub max_parts_for_multi_stage: usize,
    #[serde(default = "default_oversized_threshold")]
    pub oversized_threshold: f64,
}

fn default_base_chunk_ratio() -> f64 {
    0.4
}
fn default_min_chunk_ratio() -> f64 {
    0.15
}
fn default_safety_margin() -> f64 {
    1.2
}
fn default_max_parts() -> usize {
    4
}
fn default_oversized_threshold() -> f64 {
    0.5
}

/// DB-backed lease lock defaults (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseLockConfig {
    /// Stable identifier for this process; generated once at startup if unset.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LeaseLockConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            ttl_secs: default_ttl_secs(),
            refresh_interval_secs: default_refresh_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    120
}
fn default_refresh_secs() -> u64 {
    30
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    200
}
