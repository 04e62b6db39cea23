//! Server configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tanksync_core::{SyncConfig, ThresholdConfig, infer_metric};
use tanksync_store::RetentionLimit;
use tanksync_types::Metric;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Snapshot and retention settings.
    pub storage: StorageConfig,
    /// Sync engine tunables.
    pub sync: SyncConfig,
    /// Alert limits and quiet hours.
    pub alerts: AlertsConfig,
    /// Simulated tank backend.
    pub simulation: SimulationConfig,
    /// Sensors to sync.
    pub sensors: Vec<SensorConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Sensors to subscribe: the configured ones, or one tank with every
    /// metric when none are configured.
    pub fn effective_sensors(&self) -> Vec<SensorConfig> {
        if !self.sensors.is_empty() {
            return self.sensors.clone();
        }
        Metric::ALL
            .iter()
            .map(|metric| SensorConfig {
                id: format!("tank-1/{}", metric.as_str()),
                metric: Some(*metric),
                alias: None,
            })
            .collect()
    }

    /// Engine configuration with the alert limits applied.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            thresholds: self.alerts.limits.clone(),
            ..self.sync.clone()
        }
    }

    /// Validate the configuration and return any errors.
    ///
    /// # Example
    ///
    /// ```
    /// use tanksync_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.simulation.validate());

        if let Err(e) = self.sync.validate() {
            errors.push(ValidationError {
                field: "sync".to_string(),
                message: e.to_string(),
            });
        }
        for problem in self.alerts.limits.problems() {
            errors.push(ValidationError {
                field: "alerts.limits".to_string(),
                message: problem,
            });
        }

        let mut seen = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            let prefix = format!("sensors[{}]", i);
            errors.extend(sensor.validate(&prefix));
            if !seen.insert(sensor.id.as_str()) {
                errors.push(ValidationError {
                    field: format!("{}.id", prefix),
                    message: format!("duplicate sensor id '{}'", sensor.id),
                });
            }
        }
        if self.effective_sensors().len() > self.sync.max_subscriptions {
            errors.push(ValidationError {
                field: "sensors".to_string(),
                message: format!(
                    "{} sensors configured but sync.max_subscriptions is {}",
                    self.effective_sensors().len(),
                    self.sync.max_subscriptions
                ),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: "bind address cannot be empty".to_string(),
            });
            return errors;
        }

        match self.bind.rsplit_once(':') {
            None => errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: format!(
                    "invalid bind address '{}': expected format 'host:port'",
                    self.bind
                ),
            }),
            Some((_, port)) => match port.parse::<u16>() {
                Ok(0) => errors.push(ValidationError {
                    field: "server.bind".to_string(),
                    message: "port cannot be 0".to_string(),
                }),
                Err(_) => errors.push(ValidationError {
                    field: "server.bind".to_string(),
                    message: format!("invalid port '{}': must be a number 1-65535", port),
                }),
                Ok(_) => {}
            },
        }

        errors
    }
}

/// Snapshot and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot database path.
    pub path: PathBuf,
    /// Seconds between snapshots.
    pub snapshot_interval_secs: u64,
    /// Seconds between retention passes.
    pub retention_interval_secs: u64,
    /// Keep at most this many readings across all sensors.
    pub max_readings: Option<usize>,
    /// Keep at most this many bytes (approximate) across all sensors.
    pub max_bytes: Option<usize>,
    /// Drop readings older than this many days.
    pub max_age_days: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: tanksync_store::default_db_path(),
            snapshot_interval_secs: 300,
            retention_interval_secs: 60,
            max_readings: Some(500_000),
            max_bytes: None,
            max_age_days: Some(30),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }
        if self.snapshot_interval_secs == 0 {
            errors.push(ValidationError {
                field: "storage.snapshot_interval_secs".to_string(),
                message: "snapshot interval must be at least 1 second".to_string(),
            });
        }
        if self.retention_interval_secs == 0 {
            errors.push(ValidationError {
                field: "storage.retention_interval_secs".to_string(),
                message: "retention interval must be at least 1 second".to_string(),
            });
        }
        if self.max_age_days == Some(0) {
            errors.push(ValidationError {
                field: "storage.max_age_days".to_string(),
                message: "max age must be at least 1 day (omit to disable)".to_string(),
            });
        }

        errors
    }

    /// Size limits to enforce, tightest first.
    pub fn retention_limits(&self) -> Vec<RetentionLimit> {
        let mut limits = Vec::new();
        if let Some(count) = self.max_readings {
            limits.push(RetentionLimit::Count(count));
        }
        if let Some(bytes) = self.max_bytes {
            limits.push(RetentionLimit::Bytes(bytes));
        }
        limits
    }
}

/// Alerting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Log threshold crossings outside quiet hours.
    pub enabled: bool,
    /// Per-metric limits and quiet hours.
    pub limits: ThresholdConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: ThresholdConfig::default(),
        }
    }
}

/// Simulated tank backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Milliseconds between readings of each sensor.
    pub interval_ms: u64,
    /// Chance that a live reading is never delivered.
    pub drop_probability: f64,
    /// Chance per reading that the live stream disconnects.
    pub disconnect_probability: f64,
    /// Chance that a history page request fails.
    pub history_failure_probability: f64,
    /// Readings per history page.
    pub page_size: usize,
    /// Token handed out by the simulated identity provider.
    pub token: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            drop_probability: 0.02,
            disconnect_probability: 0.005,
            history_failure_probability: 0.05,
            page_size: 100,
            token: "simulated".to_string(),
        }
    }
}

impl SimulationConfig {
    /// Validate simulation configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_ms < 100 {
            errors.push(ValidationError {
                field: "simulation.interval_ms".to_string(),
                message: format!("interval {}ms is too short (minimum 100ms)", self.interval_ms),
            });
        }
        if self.page_size == 0 {
            errors.push(ValidationError {
                field: "simulation.page_size".to_string(),
                message: "page size must be at least 1".to_string(),
            });
        }
        for (field, p) in [
            ("drop_probability", self.drop_probability),
            ("disconnect_probability", self.disconnect_probability),
            ("history_failure_probability", self.history_failure_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                errors.push(ValidationError {
                    field: format!("simulation.{}", field),
                    message: format!("probability {} must be between 0 and 1", p),
                });
            }
        }

        errors
    }
}

/// A sensor to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Backend sensor id, e.g. `tank-1/ph`.
    pub id: String,
    /// Metric for alert limits; inferred from the id when omitted.
    #[serde(default)]
    pub metric: Option<Metric>,
    /// Friendly name.
    #[serde(default)]
    pub alias: Option<String>,
}

impl SensorConfig {
    /// The configured metric, or the one named by the id.
    pub fn resolved_metric(&self) -> Option<Metric> {
        self.metric.or_else(|| infer_metric(&self.id))
    }

    /// Validate sensor configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.id", prefix),
                message: "sensor id cannot be empty".to_string(),
            });
        }
        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.alias", prefix),
                message: "alias cannot be empty string (use null/omit instead)".to_string(),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `sensors[0].id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tanksync")
        .join("server.toml")
}
