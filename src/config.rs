use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE};
use crate::crypto::CipherMode;
use crate::error::ConfigError;
use crate::proxy::Timeouts;

/// Longest possible request header: IV, type, length, 255-byte name, port.
const MAX_HEADER_LEN: usize = 16 + 1 + 1 + 255 + 2;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: Server,
    pub security: Security,
    #[serde(rename = "securityChannel", default)]
    pub security_channel: SecurityChannel,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub ss_addr: String,
    pub ss_port: u16,
    #[serde(rename = "backEndAddr")]
    pub backend_addr: String,
    #[serde(rename = "backEndPort")]
    pub backend_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    pub cipher_mode: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityChannel {
    #[serde(rename = "GeoIP", default)]
    pub geoip: bool,
    #[serde(rename = "GeoIPDatabaseFilePath", default)]
    pub geoip_database_file_path: Option<PathBuf>,
    #[serde(default = "default_local_region")]
    pub local_region: String,
    #[serde(default = "default_dns_redirect")]
    pub dns_redirect: IpAddr,
}

impl Default for SecurityChannel {
    fn default() -> Self {
        SecurityChannel {
            geoip: false,
            geoip_database_file_path: None,
            local_region: default_local_region(),
            dns_redirect: default_dns_redirect(),
        }
    }
}

fn default_local_region() -> String {
    "CN".to_owned()
}

fn default_dns_redirect() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferConfig {
    pub size: usize,
    pub pool_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            size: DEFAULT_BUFFER_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake: u64,
    pub connect: u64,
    pub idle: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = Timeouts::default();
        TimeoutConfig {
            handshake: t.handshake.as_secs(),
            connect: t.connect.as_secs(),
            idle: t.idle.as_secs(),
        }
    }
}

pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    from_string(&text)
}

pub fn from_string(text: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.ss_addr.is_empty() {
            return Err(ConfigError::invalid("server.ssAddr", "must not be empty"));
        }
        if self.server.ss_port == 0 {
            return Err(ConfigError::invalid("server.ssPort", "must not be 0"));
        }
        if self.server.backend_addr.is_empty() {
            return Err(ConfigError::invalid("server.backEndAddr", "must not be empty"));
        }
        if self.server.backend_port == 0 {
            return Err(ConfigError::invalid("server.backEndPort", "must not be 0"));
        }
        if self.security.password.is_empty() {
            return Err(ConfigError::invalid("security.password", "must not be empty"));
        }
        self.cipher_mode()?;
        if self.security_channel.geoip && self.security_channel.geoip_database_file_path.is_none()
        {
            return Err(ConfigError::invalid(
                "securityChannel.GeoIPDatabaseFilePath",
                "required when GeoIP is enabled",
            ));
        }
        if self.buffer.size < MAX_HEADER_LEN {
            return Err(ConfigError::invalid(
                "buffer.size",
                format!("must be at least {MAX_HEADER_LEN}"),
            ));
        }
        let t = &self.timeouts;
        if t.handshake == 0 || t.connect == 0 || t.idle == 0 {
            return Err(ConfigError::invalid("timeouts", "must be positive"));
        }
        Ok(())
    }

    pub fn cipher_mode(&self) -> Result<CipherMode, ConfigError> {
        self.security
            .cipher_mode
            .parse::<CipherMode>()
            .map_err(|e| ConfigError::invalid("security.cipherMode", e.to_string()))
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(self.timeouts.handshake),
            connect: Duration::from_secs(self.timeouts.connect),
            idle: Duration::from_secs(self.timeouts.idle),
        }
    }
}
