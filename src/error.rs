use thiserror::Error;

/// Violations of the inbound envelope or of the backend SOCKS5 exchange.
/// All of them are fatal to the connection they occur on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown address type: {0}")]
    UnknownAddressType(u8),

    #[error("empty domain name")]
    EmptyDomain,

    #[error("backend is not SOCKS5: version {0}")]
    SocksVersion(u8),

    #[error("backend chose unsupported auth method: {0}")]
    AuthMethod(u8),

    #[error("backend rejected the request: reply {0}")]
    Rejected(u8),

    #[error("unknown bind address type: {0}")]
    UnknownBindAddressType(u8),

    #[error("cipher used after finish")]
    CipherFinished,

    #[error("unsupported cipher mode: {0}")]
    UnsupportedCipher(String),

    #[error("invalid IV length: expected {expected}, got {actual}")]
    IvLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
