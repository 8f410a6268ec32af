//! Configuration module for the note enrichment daemon.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `NW_` and use double underscores
//! to separate nested levels:
//! - `NW_WATCH__DEBOUNCE_MS=3000` sets `watch.debounce_ms`
//! - `NW_DISPATCH__WORKERS=8` sets `dispatch.workers`
//! - `NW_HANDLERS__TRANSCRIPT__ENABLED=false` sets `handlers.transcript.enabled`
//!
//! Settings are read once at startup and treated as immutable afterwards.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding the settings file, searched upwards from the cwd.
pub const CONFIG_DIR: &str = ".notewatch";
/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Daemon identity and registry contract (pid file, log file, status export)
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// File watching and debouncing
    #[serde(default)]
    pub watch: WatchConfig,

    /// Dispatch and worker pool
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-handler settings
    #[serde(default)]
    pub handlers: HandlersConfig,

    /// External enrichment services keyed by service name
    #[serde(default = "default_services")]
    pub services: HashMap<String, ServiceConfig>,

    /// Result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Note lifecycle
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Name used in the daemon registry and in log lines
    #[serde(default = "default_daemon_name")]
    pub name: String,

    /// Human readable description for status tooling
    #[serde(default = "default_daemon_description")]
    pub description: String,

    /// PID file written on start and removed on clean shutdown
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Log file receiving appended log lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// Health snapshot export location
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,

    /// Interval between health snapshot exports
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    /// Directory for durable daemon state (rate limit timestamps)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Root directories to watch recursively
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Quiet period before a burst of changes settles
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Capacity of the raw event queue (oldest events are dropped when full)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Glob patterns, relative to a root, that are never reported
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Force the polling watcher instead of OS notifications
    #[serde(default)]
    pub poll: bool,

    /// Poll interval when the polling watcher is used
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive subscription failures before a root is marked unhealthy
    #[serde(default = "default_max_resubscribe_attempts")]
    pub max_resubscribe_attempts: u32,

    /// Initial delay between re-subscription attempts (doubles each time)
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,
}

/// Whether a settled event goes to the first matching handler or to all of them.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    First,
    All,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatchConfig {
    /// Worker pool size (concurrent paths)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// First-match or all-matches dispatch
    #[serde(default)]
    pub mode: DispatchMode,

    /// Capacity of the settled event channel
    #[serde(default = "default_settled_capacity")]
    pub settled_capacity: usize,

    /// How long shutdown waits for in-flight handlers
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How many times a rate limited event is re-submitted
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct HandlersConfig {
    #[serde(default)]
    pub screenshot: ScreenshotConfig,

    #[serde(default)]
    pub transcript: TranscriptConfig,

    #[serde(default)]
    pub smart_link: SmartLinkConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScreenshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Where imported screenshot notes are created
    #[serde(default = "default_inbox_dir")]
    pub notes_dir: PathBuf,

    /// Image extensions (lowercase, without dot)
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,

    /// Service used for OCR and description
    #[serde(default = "default_vision_service")]
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TranscriptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Required value of the `source` frontmatter key
    #[serde(default = "default_video_source")]
    pub source: String,

    /// Maximum number of quotes requested per video
    #[serde(default = "default_max_quotes")]
    pub max_quotes: usize,

    /// Notes root scanned when cross-linking notes about the same video
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_root: Option<PathBuf>,

    #[serde(default = "default_transcript_service")]
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SmartLinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum cosine similarity for a suggestion
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f32,

    /// Maximum links appended per note
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// Maximum candidate notes embedded per run
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Notes root scanned for candidates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_root: Option<PathBuf>,

    #[serde(default = "default_embedding_service")]
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Base URL of the enrichment endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,

    /// Minimum interval between two requests to this service
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before probing
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    /// Directory holding cache entries
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Time to live of new entries
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LifecycleConfig {
    /// Optional append-only JSONL journal of status transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `notewatch::client = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 { 1 }
fn default_true() -> bool { true }
fn default_daemon_name() -> String { "notewatch".to_string() }
fn default_daemon_description() -> String { "Watches the notes vault and runs AI enrichment".to_string() }
fn default_pid_file() -> PathBuf { PathBuf::from(".notewatch/notewatch.pid") }
fn default_status_path() -> PathBuf { PathBuf::from(".notewatch/health.json") }
fn default_status_interval_ms() -> u64 { 5_000 }
fn default_state_dir() -> PathBuf { PathBuf::from(".notewatch/state") }
fn default_debounce_ms() -> u64 { 3_000 }
fn default_queue_capacity() -> usize { 1_024 }
fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/.*".to_string(),
        "**/.*/**".to_string(),
        "**/*.tmp".to_string(),
        "**/*~".to_string(),
    ]
}
fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_max_resubscribe_attempts() -> u32 { 5 }
fn default_resubscribe_backoff_ms() -> u64 { 500 }
fn default_workers() -> usize { num_cpus::get().clamp(2, 8) }
fn default_settled_capacity() -> usize { 256 }
fn default_shutdown_grace_ms() -> u64 { 10_000 }
fn default_max_deferrals() -> u32 { 3 }
fn default_inbox_dir() -> PathBuf { PathBuf::from("inbox") }
fn default_image_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "webp"].iter().map(|s| s.to_string()).collect()
}
fn default_vision_service() -> String { "vision".to_string() }
fn default_video_source() -> String { "youtube".to_string() }
fn default_max_quotes() -> usize { 5 }
fn default_transcript_service() -> String { "transcript".to_string() }
fn default_similarity_threshold() -> f32 { 0.75 }
fn default_max_links() -> usize { 5 }
fn default_max_candidates() -> usize { 50 }
fn default_embedding_service() -> String { "embedding".to_string() }
fn default_base_url() -> String { "http://127.0.0.1:8787".to_string() }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_cooldown_ms() -> u64 { 1_000 }
fn default_max_retries() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_max_ms() -> u64 { 30_000 }
fn default_failure_threshold() -> u32 { 5 }
fn default_circuit_cooldown_ms() -> u64 { 60_000 }
fn default_cache_dir() -> PathBuf { PathBuf::from(".notewatch/cache") }
fn default_cache_ttl_secs() -> u64 { 7 * 24 * 60 * 60 }
fn default_log_level() -> String { "info".to_string() }

fn default_services() -> HashMap<String, ServiceConfig> {
    let mut services = HashMap::new();
    for name in [
        default_vision_service(),
        default_transcript_service(),
        default_embedding_service(),
    ] {
        services.insert(name, ServiceConfig::default());
    }
    services
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            daemon: DaemonConfig::default(),
            watch: WatchConfig::default(),
            dispatch: DispatchConfig::default(),
            handlers: HandlersConfig::default(),
            services: default_services(),
            cache: CacheConfig::default(),
            lifecycle: LifecycleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: default_daemon_name(),
            description: default_daemon_description(),
            pid_file: default_pid_file(),
            log_path: None,
            status_path: default_status_path(),
            status_interval_ms: default_status_interval_ms(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            debounce_ms: default_debounce_ms(),
            queue_capacity: default_queue_capacity(),
            ignore_patterns: default_ignore_patterns(),
            poll: false,
            poll_interval_ms: default_poll_interval_ms(),
            max_resubscribe_attempts: default_max_resubscribe_attempts(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            mode: DispatchMode::First,
            settled_capacity: default_settled_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_deferrals: default_max_deferrals(),
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notes_dir: default_inbox_dir(),
            extensions: default_image_extensions(),
            service: default_vision_service(),
        }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: default_video_source(),
            max_quotes: default_max_quotes(),
            link_root: None,
            service: default_transcript_service(),
        }
    }
}

impl Default for SmartLinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_similarity_threshold(),
            max_links: default_max_links(),
            max_candidates: default_max_candidates(),
            link_root: None,
            service: default_embedding_service(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: None,
            timeout_ms: default_request_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            failure_threshold: default_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }
}

impl Settings {
    /// Load configuration from all sources.
    ///
    /// The settings file is found by searching upwards from the current
    /// directory for a `.notewatch` directory.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, layered over defaults and
    /// under `NW_` environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting, single underscore stays in field names
            .merge(Env::prefixed("NW_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for a `.notewatch` directory from
    /// the current directory up to the filesystem root.
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file watching `roots`.
    pub fn init_config_file(
        roots: Vec<PathBuf>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        let mut settings = Settings::default();
        settings.watch.roots = roots;
        settings.save(&config_path)?;

        Ok(config_path)
    }

    /// Settings of a named service, falling back to defaults.
    pub fn service(&self, name: &str) -> ServiceConfig {
        self.services.get(name).cloned().unwrap_or_default()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}
