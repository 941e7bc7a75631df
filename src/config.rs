use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, error};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prefix all routes are served under, e.g. `/writer`
    #[serde(default)]
    pub server_path: String,

    /// Grace interval of a write permission hand-off, in seconds
    #[serde(default = "default_sync_seconds")]
    pub sync_seconds: u64,

    /// Interval of the empty session reaper in minutes, 0 disables it
    #[serde(default = "default_gc_minutes")]
    pub gc_minutes: u64,

    /// Interval of the per-session background save in seconds
    #[serde(default = "default_save_seconds")]
    pub save_seconds: u64,

    /// Name of the storage backend
    #[serde(default)]
    pub datasafe: String,

    /// Backend specific configuration (directory, connection string, ...)
    #[serde(default)]
    pub datasafe_config: String,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config.normalized())
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Strip trailing slashes and make sure a non-empty path starts with one.
    fn normalized(mut self) -> Self {
        let trimmed = self.server_path.trim().trim_end_matches('/');
        self.server_path = if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        self
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_seconds)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_seconds.max(1))
    }

    /// Reaper interval, `None` when disabled
    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_minutes > 0).then(|| Duration::from_secs(self.gc_minutes * 60))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            server_path: String::new(),
            sync_seconds: default_sync_seconds(),
            gc_minutes: default_gc_minutes(),
            save_seconds: default_save_seconds(),
            datasafe: String::new(),
            datasafe_config: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_sync_seconds() -> u64 {
    5
}

fn default_gc_minutes() -> u64 {
    10
}

fn default_save_seconds() -> u64 {
    30
}
