use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use log::info;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub hap: HapConfig,
    pub mqtt: Option<MqttConfig>,
}

impl AppConfig {
    /// Reads the TOML config at `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(
                "No config file at {}, using built-in defaults",
                path.display()
            );
            return Ok(AppConfig::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Options handed to the accessory-protocol client on every discovery call.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HapConfig {
    pub debug: bool,
    /// Seconds spent browsing for HAP instances before the client reports ready.
    pub timeout_seconds: u64,
    /// Seconds between repeated ready notifications while the client is alive.
    pub refresh_seconds: u64,
    pub pin: String,
    pub request_timeout_seconds: u64,
}

impl Default for HapConfig {
    fn default() -> Self {
        HapConfig {
            debug: true,
            timeout_seconds: 15,
            refresh_seconds: 40,
            pin: "031-45-154".to_string(),
            request_timeout_seconds: 4,
        }
    }
}

impl HapConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Per-request timeout that still lets a listing started at `Ready` finish before `deadline`.
    pub fn fetch_timeout(&self, deadline: Duration) -> Duration {
        let budget = deadline.saturating_sub(self.discovery_window());
        self.request_timeout()
            .min(budget)
            .max(Duration::from_secs(1))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}
