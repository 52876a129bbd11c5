//! Configuration types and loading

use chrono::FixedOffset;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote service endpoints and identity
    pub api: ApiConfig,

    /// Network time servers
    pub ntp: NtpConfig,

    /// Scheduling and retry policy
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .miunlock.yml
        let local_config = PathBuf::from(".miunlock.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/miunlock/miunlock.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("miunlock").join("miunlock.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Remote service endpoints and request identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the community API
    pub base_url: String,

    /// Account login endpoint
    pub auth_url: String,

    /// Account region lookup endpoint
    pub region_url: String,

    /// User-Agent header sent on every request
    pub user_agent: String,

    /// Service id presented during login
    pub service_sid: String,

    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sgp-api.buy.mi.com/bbs/api/global/".to_string(),
            auth_url: "https://account.xiaomi.com/pass/serviceLoginAuth2".to_string(),
            region_url: "https://account.xiaomi.com/pass/user/login/region".to_string(),
            user_agent: "XiaoMi/MiuiBrowser/14.28.0-gn".to_string(),
            service_sid: "18n_bbs_global".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    /// Per-request timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Network time source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    /// Ordered list of time servers, tried first to last
    pub servers: Vec<String>,

    /// Per-server query budget in seconds
    #[serde(default = "default_ntp_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ntp_timeout_secs() -> u64 {
    5
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "pool.ntp.org".to_string(),
                "time.google.com".to_string(),
                "time.windows.com".to_string(),
            ],
            timeout_secs: 5,
        }
    }
}

impl NtpConfig {
    /// Per-server query budget as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scheduling and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Attempts allowed within one per-minute cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between failed attempts, in seconds
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Upper bound of the random post-boundary jitter, in seconds
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: f64,

    /// Fixed UTC offset of the service's eligibility window, in hours
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    /// Precise-sleep wakeup tolerance, in milliseconds
    #[serde(default = "default_sleep_precision_ms")]
    pub sleep_precision_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_jitter_max_secs() -> f64 {
    10.0
}

fn default_utc_offset_hours() -> i32 {
    8
}

fn default_sleep_precision_ms() -> u64 {
    10
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 60,
            jitter_max_secs: 10.0,
            utc_offset_hours: 8,
            sleep_precision_ms: 10,
        }
    }
}

impl ScheduleConfig {
    /// Inter-attempt delay as a Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Precise-sleep tolerance as a Duration
    pub fn sleep_precision(&self) -> Duration {
        Duration::from_millis(self.sleep_precision_ms)
    }

    /// The fixed offset zone the eligibility window is defined in
    pub fn zone(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .ok_or_else(|| eyre!("Invalid UTC offset: {} hours", self.utc_offset_hours))
    }
}
