use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid JSON in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// Account selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Stay on the current account until it becomes unusable
    #[default]
    Sticky,
    /// Rotate to the next eligible account each request
    RoundRobin,
    /// Score-based selection from health, tokens, and freshness
    Hybrid,
}

impl SelectionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sticky" => Some(SelectionStrategy::Sticky),
            "round-robin" | "roundrobin" | "rr" => Some(SelectionStrategy::RoundRobin),
            "hybrid" | "smart" => Some(SelectionStrategy::Hybrid),
            _ => None,
        }
    }
}

/// How the dispatcher trades prompt-cache locality against latency when an
/// account gets rate-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Always switch to another account on rate limit
    PerformanceFirst,
    /// Wait out short limits to keep the server-side prompt cache warm
    #[default]
    CacheFirst,
    /// Wait only for very short limits, otherwise switch
    Balance,
}

impl SchedulingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "performance_first" | "performance-first" => Some(SchedulingMode::PerformanceFirst),
            "cache_first" | "cache-first" => Some(SchedulingMode::CacheFirst),
            "balance" => Some(SchedulingMode::Balance),
            _ => None,
        }
    }
}

/// Global config instance (uses default if load fails at static init)
static GLOBAL_CONFIG: LazyLock<RwLock<Config>> =
    LazyLock::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a clone of the global config
pub fn get_config() -> Config {
    GLOBAL_CONFIG.read().clone()
}

/// Initialize global config with overrides
pub fn init_config(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

/// codexmux configuration loaded from `~/.config/codexmux/config.json`.
///
/// Every field has a default; environment variables named
/// `CODEXMUX_<FIELD>` override file values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,

    /// Enable the vendor-specific body transform path
    pub codex_mode: bool,
    pub account_selection_strategy: SelectionStrategy,
    /// Stagger the starting account of parallel processes
    pub pid_offset_enabled: bool,
    /// Suppress non-essential toasts
    pub quiet_mode: bool,
    /// Treat tokens as "needs refresh" this early (ms)
    pub token_refresh_skew_ms: u64,
    /// Enable the background refresh queue + scheduler
    pub proactive_token_refresh: bool,
    /// Per-account toast dedup window (ms)
    pub rate_limit_toast_debounce_ms: u64,
    /// Wait and retry when every account is rate-limited
    pub retry_all_accounts_rate_limited: bool,
    /// Ceiling on the all-accounts wait (ms); 0 disables the ceiling
    pub retry_all_accounts_max_wait_ms: u64,
    pub retry_all_accounts_max_retries: u32,
    pub scheduling_mode: SchedulingMode,
    pub max_cache_first_wait_seconds: u64,
    pub switch_on_first_rate_limit: bool,
    pub rate_limit_dedup_window_ms: u64,
    pub rate_limit_state_reset_ms: u64,
    /// Fallback backoff base when the server sends no Retry-After (ms)
    pub default_retry_after_ms: u64,
    pub max_backoff_ms: u64,
    pub request_jitter_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            codex_mode: true,
            account_selection_strategy: SelectionStrategy::Sticky,
            pid_offset_enabled: true,
            quiet_mode: false,
            token_refresh_skew_ms: 60_000,
            proactive_token_refresh: false,
            rate_limit_toast_debounce_ms: 60_000,
            retry_all_accounts_rate_limited: false,
            retry_all_accounts_max_wait_ms: 30_000,
            retry_all_accounts_max_retries: 1,
            scheduling_mode: SchedulingMode::CacheFirst,
            max_cache_first_wait_seconds: 60,
            switch_on_first_rate_limit: true,
            rate_limit_dedup_window_ms: 2_000,
            rate_limit_state_reset_ms: 120_000,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            request_jitter_max_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Overall per-call timeout covering retries and rotation (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    8399
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log request/response summaries for debugging
    #[serde(default)]
    pub log_requests: bool,
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codexmux")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Path of the persisted account store.
    pub fn accounts_path() -> PathBuf {
        Self::dir().join("openai-codex-accounts.json")
    }

    /// Pre-XDG account store location, migrated on first read.
    pub fn legacy_accounts_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".opencode")
            .join("openai-codex-accounts.json")
    }

    /// Path of the persisted quota telemetry snapshots.
    pub fn snapshots_path() -> PathBuf {
        Self::dir().join("codex-quota-snapshots.json")
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str::<Config>(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        if config.max_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                path,
                field: "max_backoff_ms".to_string(),
                value: "0".to_string(),
                valid_values: vec!["positive milliseconds".to_string()],
            });
        }

        Ok(config)
    }

    /// Apply `CODEXMUX_*` environment variable overrides. Env wins over
    /// file values.
    pub fn apply_env_overrides(&mut self) {
        fn env_bool(name: &str) -> Option<bool> {
            match std::env::var(name).ok()?.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok()?.trim().parse().ok()
        }
        fn env_u32(name: &str) -> Option<u32> {
            std::env::var(name).ok()?.trim().parse().ok()
        }

        if let Some(v) = env_bool("CODEXMUX_CODEX_MODE") {
            self.codex_mode = v;
        }
        if let Some(s) = std::env::var("CODEXMUX_ACCOUNT_SELECTION_STRATEGY").ok()
            && let Some(v) = SelectionStrategy::parse(&s)
        {
            self.account_selection_strategy = v;
        }
        if let Some(v) = env_bool("CODEXMUX_PID_OFFSET_ENABLED") {
            self.pid_offset_enabled = v;
        }
        if let Some(v) = env_bool("CODEXMUX_QUIET_MODE") {
            self.quiet_mode = v;
        }
        if let Some(v) = env_u64("CODEXMUX_TOKEN_REFRESH_SKEW_MS") {
            self.token_refresh_skew_ms = v;
        }
        if let Some(v) = env_bool("CODEXMUX_PROACTIVE_TOKEN_REFRESH") {
            self.proactive_token_refresh = v;
        }
        if let Some(v) = env_u64("CODEXMUX_RATE_LIMIT_TOAST_DEBOUNCE_MS") {
            self.rate_limit_toast_debounce_ms = v;
        }
        if let Some(v) = env_bool("CODEXMUX_RETRY_ALL_ACCOUNTS_RATE_LIMITED") {
            self.retry_all_accounts_rate_limited = v;
        }
        if let Some(v) = env_u64("CODEXMUX_RETRY_ALL_ACCOUNTS_MAX_WAIT_MS") {
            self.retry_all_accounts_max_wait_ms = v;
        }
        if let Some(v) = env_u32("CODEXMUX_RETRY_ALL_ACCOUNTS_MAX_RETRIES") {
            self.retry_all_accounts_max_retries = v;
        }
        if let Some(s) = std::env::var("CODEXMUX_SCHEDULING_MODE").ok()
            && let Some(v) = SchedulingMode::parse(&s)
        {
            self.scheduling_mode = v;
        }
        if let Some(v) = env_u64("CODEXMUX_MAX_CACHE_FIRST_WAIT_SECONDS") {
            self.max_cache_first_wait_seconds = v;
        }
        if let Some(v) = env_bool("CODEXMUX_SWITCH_ON_FIRST_RATE_LIMIT") {
            self.switch_on_first_rate_limit = v;
        }
        if let Some(v) = env_u64("CODEXMUX_RATE_LIMIT_DEDUP_WINDOW_MS") {
            self.rate_limit_dedup_window_ms = v;
        }
        if let Some(v) = env_u64("CODEXMUX_RATE_LIMIT_STATE_RESET_MS") {
            self.rate_limit_state_reset_ms = v;
        }
        if let Some(v) = env_u64("CODEXMUX_DEFAULT_RETRY_AFTER_MS") {
            self.default_retry_after_ms = v;
        }
        if let Some(v) = env_u64("CODEXMUX_MAX_BACKOFF_MS") {
            self.max_backoff_ms = v;
        }
        if let Some(v) = env_u64("CODEXMUX_REQUEST_JITTER_MAX_MS") {
            self.request_jitter_max_ms = v;
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn host(&self) -> &str {
        &self.server.host
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>, debug: bool) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = Config::default();
        assert!(config.codex_mode);
        assert_eq!(
            config.account_selection_strategy,
            SelectionStrategy::Sticky
        );
        assert!(config.pid_offset_enabled);
        assert!(!config.quiet_mode);
        assert_eq!(config.token_refresh_skew_ms, 60_000);
        assert!(!config.proactive_token_refresh);
        assert_eq!(config.rate_limit_toast_debounce_ms, 60_000);
        assert!(!config.retry_all_accounts_rate_limited);
        assert_eq!(config.retry_all_accounts_max_wait_ms, 30_000);
        assert_eq!(config.retry_all_accounts_max_retries, 1);
        assert_eq!(config.scheduling_mode, SchedulingMode::CacheFirst);
        assert_eq!(config.max_cache_first_wait_seconds, 60);
        assert!(config.switch_on_first_rate_limit);
        assert_eq!(config.rate_limit_dedup_window_ms, 2_000);
        assert_eq!(config.rate_limit_state_reset_ms, 120_000);
        assert_eq!(config.default_retry_after_ms, 60_000);
        assert_eq!(config.max_backoff_ms, 120_000);
        assert_eq!(config.request_jitter_max_ms, 1_000);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            SelectionStrategy::parse("round-robin"),
            Some(SelectionStrategy::RoundRobin)
        );
        assert_eq!(
            SelectionStrategy::parse("RR"),
            Some(SelectionStrategy::RoundRobin)
        );
        assert_eq!(
            SelectionStrategy::parse("hybrid"),
            Some(SelectionStrategy::Hybrid)
        );
        assert_eq!(SelectionStrategy::parse("bogus"), None);
    }

    #[test]
    fn test_scheduling_mode_parse() {
        assert_eq!(
            SchedulingMode::parse("performance_first"),
            Some(SchedulingMode::PerformanceFirst)
        );
        assert_eq!(
            SchedulingMode::parse("cache-first"),
            Some(SchedulingMode::CacheFirst)
        );
        assert_eq!(SchedulingMode::parse("balance"), Some(SchedulingMode::Balance));
        assert_eq!(SchedulingMode::parse("other"), None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"scheduling_mode":"balance","quiet_mode":true}"#).unwrap();
        assert_eq!(config.scheduling_mode, SchedulingMode::Balance);
        assert!(config.quiet_mode);
        assert_eq!(config.max_backoff_ms, 120_000);
        assert_eq!(config.account_selection_strategy, SelectionStrategy::Sticky);
    }

    #[test]
    fn test_env_override_wins() {
        let mut config = Config::default();
        // Env var name chosen to avoid colliding with other tests
        unsafe { std::env::set_var("CODEXMUX_MAX_BACKOFF_MS", "90000") };
        config.apply_env_overrides();
        unsafe { std::env::remove_var("CODEXMUX_MAX_BACKOFF_MS") };
        assert_eq!(config.max_backoff_ms, 90_000);
    }

    #[test]
    fn test_config_paths() {
        assert!(Config::path().to_string_lossy().contains("codexmux"));
        assert!(
            Config::accounts_path()
                .to_string_lossy()
                .ends_with("openai-codex-accounts.json")
        );
        assert!(
            Config::legacy_accounts_path()
                .to_string_lossy()
                .contains(".opencode")
        );
    }

    #[test]
    fn test_with_overrides() {
        let config = Config::default().with_overrides(Some(3000), Some("0.0.0.0".into()), true);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.logging.debug);
    }
}
