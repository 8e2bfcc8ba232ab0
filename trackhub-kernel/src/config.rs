use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "trackhub-kernel";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: ConnectionConfig,
    pub status: StatusConf,
}

/// Paramètres de connexion au broker. Figés dès qu'une tentative de connexion démarre.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// CA au format PEM, obligatoire si `tls`
    pub ca_file: Option<PathBuf>,
    pub client_id: String,
    /// Borne des handshakes connect / subscribe / unsubscribe
    pub timeout_ms: u64,
    pub keep_alive_secs: u64,
    /// Capacité de la file entre l'event loop MQTT et la boucle de dispatch
    pub queue_capacity: usize,
    /// Attente max pour déposer un message dans une file pleine avant de le jeter
    pub forward_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatusConf {
    pub interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            tls: false,
            ca_file: None,
            client_id: DEFAULT_CLIENT_ID.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            keep_alive_secs: 30,
            queue_capacity: 256,
            forward_timeout_ms: 1_000,
        }
    }
}

impl Default for StatusConf {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// Adresse du broker, ex: "ssl://broker.example.org:8883"
    pub fn broker_address(&self) -> String {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Les credentials peuvent venir de l'environnement plutôt que du fichier
    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("TRACKHUB_MQTT_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("TRACKHUB_MQTT_PASSWORD") {
            self.password = Some(pass);
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("TRACKHUB_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_from(&path).await;
    cfg.mqtt.apply_env_overrides();
    cfg
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
            return KernelConfig::default();
        }
    };
    parse_config(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        KernelConfig::default()
    })
}
