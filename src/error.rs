/// Errors raised by the collector library.
///
/// Transport failures are normally absorbed by the poll engine; only
/// configuration defects and persistence failures escape a poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration is inconsistent (duplicate or unsafe names, bad word count, ...).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("Cannot parse configuration: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    /// Reading the configuration file failed.
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The decoder received a different number of words than the wire type occupies.
    #[error("Malformed payload: expected {expected} registers, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    /// The persistence backend rejected an operation or is unreachable.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] sqlx::Error),

    /// A server or register was addressed that the store does not know.
    #[error("Unknown table or column: {0}")]
    UnknownTarget(String),

    /// The MQTT broker could not be reached.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] paho_mqtt::Error),
}

/// The result type of the collector library.
pub type Result<T> = std::result::Result<T, Error>;
