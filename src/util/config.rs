use std::{num::NonZeroUsize, sync::OnceLock, time::Duration};

use config::{Config, FileFormat};
use thiserror::Error;

use crate::dto::SummaryParams;

pub fn get_config() -> anyhow::Result<&'static Config> {
    static CONFIG: OnceLock<Config> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = build_config()?;
    Ok(CONFIG.get_or_init(|| config))
}

fn build_config() -> Result<Config, config::ConfigError> {
    config_builder()?
        .add_source(config::Environment::with_prefix("ENERGY_MONITOR"))
        .add_source(config::File::new("energy-monitor.toml", FileFormat::Toml).required(false))
        .build()
}

fn config_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError>
{
    Config::builder()
        .set_default("http_addr", "127.0.0.1:3000")?
        .set_default("mqtt_host", "localhost")?
        .set_default("mqtt_port", 1883)?
        .set_default("mqtt_keep_alive", 60)?
        .set_default("mqtt_connect_timeout_ms", 30000)?
        .set_default("mqtt_client_id", "lora-energy-monitor")?
        .set_default(
            "mqtt_topic",
            "application/1/device/9fb27692fb0c2381/event/up",
        )?
        .set_default("history_capacity", 100)?
        .set_default("poll_interval_secs", 2)?
        .set_default("tariff_rate", 11.16)?
        .set_default("nominal_voltage", 220.0)?
        .set_default("simulate_interval_secs", 5)
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub topic: String,
}

impl MqttSettings {
    /// Username and password, only when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }

    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub http_addr: String,
    pub mqtt: MqttSettings,
    pub history_capacity: NonZeroUsize,
    pub poll_interval: Duration,
    pub summary: SummaryParams,
    pub simulate_interval: Duration,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::from_config(get_config()?)?)
    }

    pub fn from_config(config: &Config) -> Result<Self, SettingsError> {
        let mqtt = MqttSettings {
            host: config.get_string("mqtt_host")?,
            port: ranged(config, "mqtt_port", 1, u16::MAX as i64)? as u16,
            username: optional_string(config, "mqtt_username"),
            password: optional_string(config, "mqtt_password"),
            client_id: config.get_string("mqtt_client_id")?,
            keep_alive: Duration::from_secs(ranged(config, "mqtt_keep_alive", 5, 3600)? as u64),
            connect_timeout: Duration::from_millis(
                ranged(config, "mqtt_connect_timeout_ms", 100, 300_000)? as u64,
            ),
            topic: config.get_string("mqtt_topic")?,
        };

        let history_capacity = ranged(config, "history_capacity", 1, 1_000_000)? as usize;

        Ok(Settings {
            http_addr: config.get_string("http_addr")?,
            mqtt,
            history_capacity: NonZeroUsize::new(history_capacity).unwrap_or(NonZeroUsize::MIN),
            poll_interval: Duration::from_secs(ranged(config, "poll_interval_secs", 1, 10)? as u64),
            summary: SummaryParams {
                tariff_rate: config.get_float("tariff_rate")?,
                nominal_voltage: config.get_float("nominal_voltage")?,
            },
            simulate_interval: Duration::from_secs(
                ranged(config, "simulate_interval_secs", 1, 3600)? as u64,
            ),
        })
    }
}

fn ranged(config: &Config, key: &'static str, min: i64, max: i64) -> Result<i64, SettingsError> {
    let value = config.get_int(key)?;
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(SettingsError::OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

fn optional_string(config: &Config, key: &str) -> Option<String> {
    config
        .get_string(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
