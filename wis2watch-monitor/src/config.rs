use crate::broker::BackoffPolicy;
use crate::models::Node;
use crate::mqtt::BrokerAddress;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub http: HttpConf,
    pub log_format: LogFormat,
    pub mqtt: MqttConf,
    pub backoff: BackoffConf,
    pub bus: BusConf,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Capacité de la file de requêtes rumqttc
    pub request_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConf {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConf {
    /// Taille de la file de chaque abonné
    pub queue_capacity: usize,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: SocketAddr::from(([0, 0, 0, 0], 8080)) }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            client_id_prefix: "wis2watch".into(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            request_capacity: 32,
        }
    }
}

impl Default for BackoffConf {
    fn default() -> Self {
        Self { base_ms: 1_000, max_ms: 60_000, max_attempts: 10 }
    }
}

impl Default for BusConf {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http: HttpConf::default(),
            log_format: LogFormat::default(),
            mqtt: MqttConf::default(),
            backoff: BackoffConf::default(),
            bus: BusConf::default(),
            nodes: Vec::new(),
        }
    }
}

impl MqttConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BackoffConf {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl MonitorConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: MonitorConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid("backoff.max_attempts must be >= 1".into()));
        }
        if self.backoff.base_ms == 0 || self.backoff.max_ms < self.backoff.base_ms {
            return Err(ConfigError::Invalid(
                "backoff requires 0 < base_ms <= max_ms".into(),
            ));
        }
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::Invalid("bus.queue_capacity must be >= 1".into()));
        }
        if self.mqtt.request_capacity == 0 || self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.request_capacity and mqtt.connect_timeout_secs must be >= 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", node.id)));
            }
            BrokerAddress::parse(&node.broker_url).map_err(|e| {
                ConfigError::Invalid(format!("node {}: {e}", node.id))
            })?;
            if node.active && node.topics.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "node {} is active but has no topics",
                    node.id
                )));
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(bind) = std::env::var("WIS2WATCH_BIND") {
            self.http.bind = bind
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("WIS2WATCH_BIND: {e}")))?;
        }
        if let Ok(format) = std::env::var("WIS2WATCH_LOG_FORMAT") {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "WIS2WATCH_LOG_FORMAT: unknown format {other}"
                    )))
                }
            };
        }
        Ok(())
    }
}

/// Charge la config depuis `WIS2WATCH_CONFIG` (défaut `wis2watch.yaml`).
/// Fichier absent => config par défaut sans nœud ; fichier invalide => erreur.
pub async fn load_config() -> Result<MonitorConfig, ConfigError> {
    let path = std::env::var("WIS2WATCH_CONFIG").unwrap_or_else(|_| "wis2watch.yaml".into());
    let mut cfg = load_config_from(&path).await?;
    cfg.apply_env_overrides()?;
    Ok(cfg)
}

pub async fn load_config_from(path: impl AsRef<Path>) -> Result<MonitorConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(MonitorConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    MonitorConfig::from_yaml_str(&txt)
}
