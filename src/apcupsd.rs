use crate::configuration::Configuration;
use crate::error::FetchError;
use crate::status::UpsSnapshot;
use log::trace;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Units that apcupsd appends to its values
const UNITS: [&str; 10] = [
    "Percent Load Capacity",
    "Minutes",
    "Seconds",
    "Percent",
    "Volts",
    "Watts",
    "Amps",
    "Hz",
    "VA",
    "C",
];

/// Source of UPS snapshots
#[allow(async_fn_in_trait)]
pub trait Fetcher {
    /// Reads every status field of the UPS
    async fn fetch(&self) -> Result<UpsSnapshot, FetchError>;
}

/// Client of the apcupsd network information server (NIS)
#[derive(Debug, Clone)]
pub struct ApcupsdClient {
    host: String,
    port: u16,
    timeout: Duration,
    strip_units: bool,
}

/// Removes the unit apcupsd appends to a value, if any
///
/// ```
/// use apcupsd_mqtt::apcupsd::strip_unit;
///
/// assert_eq!(strip_unit("230.0 Volts"), "230.0");
/// assert_eq!(strip_unit("ONLINE"), "ONLINE");
/// ```
pub fn strip_unit(value: &str) -> &str {
    for unit in UNITS {
        if let Some(stripped) = value
            .strip_suffix(unit)
            .and_then(|v| v.strip_suffix(' '))
        {
            return stripped;
        }
    }
    value
}

/// Parses the `KEY : value` lines of a status report
///
/// Lines without a colon are ignored.
pub fn parse_status<'a, I>(lines: I, strip_units: bool) -> UpsSnapshot
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| {
            let value = value.trim();
            let value = if strip_units { strip_unit(value) } else { value };
            (key.trim(), value)
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

impl ApcupsdClient {
    pub fn new(host: &str, port: u16, timeout: Duration, strip_units: bool) -> ApcupsdClient {
        ApcupsdClient {
            host: host.to_string(),
            port,
            timeout,
            strip_units,
        }
    }

    /// Constructs a client from the `[apcupsd]` section of the configuration
    pub fn from_config(config: &Configuration) -> ApcupsdClient {
        Self::new(
            &config.apcupsd.host,
            config.apcupsd.port,
            config.apcupsd_timeout(),
            config.apcupsd.strip_units,
        )
    }

    /// Address of apcupsd, as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sends the `status` command and reads the records until the empty one
    async fn exchange(&self) -> Result<Vec<String>, FetchError> {
        let address = self.address();
        let mut stream = TcpStream::connect(&address)
            .await
            .map_err(|source| FetchError::Connect {
                host: address.clone(),
                source,
            })?;

        let command = b"status";
        stream.write_u16(command.len() as u16).await?;
        stream.write_all(command).await?;
        stream.flush().await?;

        let mut records = Vec::new();
        loop {
            let len = stream.read_u16().await? as usize;
            if len == 0 {
                break;
            }
            let mut buffer = vec![0; len];
            stream.read_exact(&mut buffer).await?;
            let record = String::from_utf8_lossy(&buffer).into_owned();
            trace!("apcupsd record from {address}: {}", record.trim_end());
            records.push(record);
        }

        Ok(records)
    }
}

impl Fetcher for ApcupsdClient {
    async fn fetch(&self) -> Result<UpsSnapshot, FetchError> {
        let records = timeout(self.timeout, self.exchange())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let snapshot = parse_status(records.iter().flat_map(|r| r.lines()), self.strip_units);
        if snapshot.is_empty() {
            return Err(FetchError::Protocol(format!(
                "no status field in the reply of {}",
                self.address()
            )));
        }
        Ok(snapshot)
    }
}
