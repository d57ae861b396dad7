use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems with the configuration or the sensor catalog. These are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid {category} sensor `{name}`: {reason}")]
    InvalidSensor {
        category: String,
        name: String,
        reason: String,
    },

    #[error("sensors `{first}` and `{second}` both publish discovery on {topic}")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },

    #[error("cannot serialize discovery payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure to read a snapshot from apcupsd. Recovered by the poll loop.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("cannot connect to apcupsd at {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while talking to apcupsd: {0}")]
    Io(#[from] io::Error),

    #[error("apcupsd did not answer within {0:?}")]
    Timeout(Duration),

    #[error("malformed reply from apcupsd: {0}")]
    Protocol(String),
}

/// Failure to deliver messages to the MQTT broker. Recovered by the poll loop.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("MQTT broker did not acknowledge within {0:?}")]
    Timeout(Duration),
}

/// A derived metric could not be evaluated from the snapshot.
#[derive(Error, Debug, PartialEq)]
#[error("cannot compute {field}: {reason}")]
pub struct CalculationError {
    pub field: &'static str,
    pub reason: String,
}
