use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::{env, path::Path, result::Result, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub log_filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub quota_per_second: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptLimits {
    pub rate_limit_per_sec: usize,
    pub refill_interval_ms: usize,
    pub refill_amount: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub key: String,
    pub endpoint: String,
    pub prompt_limits: PromptLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub detection_confidence_threshold: f64,
    pub rule_acceptance_threshold: f64,
    pub prompt_body_chars: usize,
}

impl ModelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    pub search_query: String,
    pub page_size: u32,
    pub batch_size: usize,
    /// Pause between successive fetch batches, keeps us under the upstream quota
    pub batch_pause_ms: u64,
    pub fetch_timeout_secs: u64,
    pub checkpoint_every: u64,
    pub default_lookback_years: u32,
}

impl ScanConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancellationConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub monitoring_window_days: i64,
    pub monitor_interval_secs: u64,
    pub monitor_max_results: u32,
    pub browser_timeout_secs: u64,
    pub browser_selector_timeout_ms: u64,
    pub browser_settle_ms: u64,
    /// Launch a headless Chromium for form links
    #[serde(default)]
    pub browser_enabled: bool,
    /// Chromium binary; `CHROME_BIN` or the usual install paths when unset
    #[serde(default)]
    pub browser_executable: Option<String>,
}

impl CancellationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn monitoring_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.monitoring_window_days)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_timeout_secs)
    }

    pub fn browser_selector_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_selector_timeout_ms)
    }

    pub fn browser_settle(&self) -> Duration {
        Duration::from_millis(self.browser_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub max_attempts: u32,
    pub redelivery_backoff_ms: u64,
    pub tracker_log_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub settings: Settings,
    pub gmail: GmailConfig,
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub scan: ScanConfig,
    pub cancellation: CancellationConfig,
    pub jobs: JobsConfig,
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of the log
        write!(
            f,
            "Server Config:\n{:?}\n\nGmail API: {}\n\nModel Config: {:?}\n\nScan Config: {:?}\n\nCancellation Config: {:?}\n\nJobs Config: {:?}",
            self.settings,
            self.gmail.api_base,
            self.model,
            self.scan,
            self.cancellation,
            self.jobs,
        )
    }
}

impl ServerConfig {
    /// `APP_DIR/config.toml`, or `<workspace>/config/config.toml` during development
    pub fn default_path() -> String {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
            let dir = Path::new(&dir)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or(dir);
            format!("{}/config", dir)
        });
        format!("{root}/config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("SUBSCOUT").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
