//! YAML configuration of the collector.

use crate::descriptor::{validate_servers, ServerDescriptor};
use crate::{Error, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("collector.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Quality of service code to use
    #[serde(default)]
    qos: u8,
}

fn default_client_id() -> String {
    String::from("modcol")
}

fn default_topic_prefix() -> String {
    String::from("modcol")
}

impl MqttConfig {
    pub fn qos(&self) -> i32 {
        self.qos as i32
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    pub servers: Vec<ServerDescriptor>,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "config.yml";

    /// Parses and validates a configuration.
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Config = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {}", path.display());
        Self::from_reader(File::open(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        validate_servers(&self.servers)?;
        if self.modbus.connect_timeout.is_zero() || self.modbus.read_timeout.is_zero() {
            return Err(Error::Config("Modbus timeouts must not be zero".into()));
        }
        if self.modbus.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must not be zero".into()));
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.qos > 2 {
                return Err(Error::Config(format!(
                    "MQTT qos must be 0, 1 or 2, not {}",
                    mqtt.qos
                )));
            }
        }
        Ok(())
    }
}
