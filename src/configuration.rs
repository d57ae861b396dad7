use crate::error::ConfigError;
use crate::home_assistant::topic_token;
use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::path::Path;
use std::time::Duration;

/// Configuration used when no configuration file can be found
pub const DEFAULT_CONFIGURATION: &str = include_str!("../conf/apcupsd-mqtt.conf");

const DEFAULT_APCUPSD_HOST: &str = "127.0.0.1";
const DEFAULT_APCUPSD_PORT: u16 = 3551;
const DEFAULT_TIMEOUT: f64 = 10.0;

/// Contains the configuration for communicating with the MQTT broker
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Mqtt {
    /// Hostname or IP address. Default: localhost
    #[serde_inline_default(String::from("localhost"))]
    pub host: String,

    /// Port of the connection to the broker. Default: 1883
    #[serde_inline_default(1883)]
    pub port: u16,

    /// Username for the connection to the broker. Default: empty, which means no authentication
    #[serde(default)]
    pub user: String,

    /// Password for the connection to the broker. Default: empty
    #[serde(default)]
    pub password: String,

    /// Prefix for the registration topic sent to Home Assistant. Default: homeassistant
    ///
    /// This must match the configuration of the MQTT integration in Home Assistant
    ///
    /// See <https://www.home-assistant.io/integrations/mqtt#discovery-options>
    #[serde_inline_default(String::from("homeassistant"))]
    #[serde(rename = "registration-prefix")]
    pub registration_prefix: String,

    /// Prefix of the state and availability topics. Default: apcupsd
    #[serde_inline_default(String::from("apcupsd"))]
    #[serde(rename = "state-prefix")]
    pub state_prefix: String,

    /// MQTT client identifier. Default: `apcupsd-mqtt-<hostname>`
    #[serde(default = "client_id", rename = "client-id")]
    pub client_id: String,

    /// Time allowed for one connect-publish-disconnect exchange, in seconds. Default: 10
    #[serde_inline_default(DEFAULT_TIMEOUT)]
    pub timeout: f64,
}

/// Contains the configuration for reaching the apcupsd network information server
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Apcupsd {
    /// Hostname or IP address of apcupsd. Default: 127.0.0.1
    #[serde_inline_default(String::from(DEFAULT_APCUPSD_HOST))]
    pub host: String,

    /// NIS port of apcupsd. Default: 3551
    #[serde_inline_default(DEFAULT_APCUPSD_PORT)]
    pub port: u16,

    /// Time allowed for one status query, in seconds. Default: 10
    #[serde_inline_default(DEFAULT_TIMEOUT)]
    pub timeout: f64,

    /// Removes units such as `Volts` or `Percent` from the reported values. Default: true
    #[serde_inline_default(true)]
    #[serde(rename = "strip-units")]
    pub strip_units: bool,
}

impl Default for Apcupsd {
    fn default() -> Self {
        Apcupsd {
            host: String::from(DEFAULT_APCUPSD_HOST),
            port: DEFAULT_APCUPSD_PORT,
            timeout: DEFAULT_TIMEOUT,
            strip_units: true,
        }
    }
}

/// Contains all the configuration for `apcupsd-mqtt`
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    /// Contains the configuration for communicating with the MQTT broker
    pub mqtt: Mqtt,

    /// Contains the configuration for apcupsd
    #[serde(default)]
    pub apcupsd: Apcupsd,

    /// Name of the UPS in the topics. Default: the serial number reported by the UPS
    #[serde(default)]
    pub alias: Option<String>,

    /// Delay between each poll in seconds. Default: 10 seconds
    #[serde_inline_default(10.0)]
    #[serde(rename = "update-period")]
    pub update_period: f64,

    /// Path to the sensor catalog. Default: the built-in catalog
    #[serde(default)]
    pub sensors: Option<String>,

    /// Sets the verbosity of the logs.
    ///  * 1 => Error
    ///  * 2 => Warning
    ///  * 3 => Info
    ///  * 4 => Debug
    ///  * 5 => Trace
    #[serde_inline_default(3)]
    #[serde(rename = "log-verbosity")]
    pub log_verbosity: usize,

    /// Forces at least the debug verbosity
    #[serde(default)]
    pub debug: bool,
}

fn client_id() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| String::from("localhost"));
    format!("apcupsd-mqtt-{host}")
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("{value} is not a positive number of seconds"),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })
}

fn parse_override<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field,
        reason: format!("`{value}`: {e}"),
    })
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Configuration {
    /// Load the configuration from a file
    ///
    /// ## Example
    ///
    /// ```
    /// use apcupsd_mqtt::Configuration;
    ///
    /// let config = Configuration::load("conf/apcupsd-mqtt.conf").expect("Cannot load configuration");
    ///
    /// assert_eq!(config.mqtt.host, "localhost");
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Configuration, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parses a configuration from its TOML text. `origin` only appears in error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Configuration, ConfigError> {
        let mut config: Configuration =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?;
        // A blank alias means no alias, as with UPS_ALIAS
        config.alias = config.alias.filter(|a| !a.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    /// The built-in configuration
    pub fn builtin() -> Result<Configuration, ConfigError> {
        Self::parse(DEFAULT_CONFIGURATION, "built-in configuration")
    }

    /// Applies the overrides found in the process environment
    pub fn apply_environment(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from a variable lookup, such as the process environment
    ///
    /// ## Example
    ///
    /// ```
    /// use apcupsd_mqtt::Configuration;
    ///
    /// let mut config = Configuration::builtin().unwrap();
    /// config
    ///     .apply_overrides(|name| (name == "MQTT_PORT").then(|| String::from("8883")))
    ///     .unwrap();
    ///
    /// assert_eq!(config.mqtt.port, 8883);
    /// ```
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_override("MQTT_PORT", &port)?;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt.user = user;
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = password;
        }
        if let Some(host) = lookup("APCUPSD_HOST") {
            self.apcupsd.host = host;
        }
        if let Some(port) = lookup("APCUPSD_PORT") {
            self.apcupsd.port = parse_override("APCUPSD_PORT", &port)?;
        }
        if let Some(alias) = lookup("UPS_ALIAS") {
            self.alias = Some(alias).filter(|a| !a.trim().is_empty());
        }
        if let Some(interval) = lookup("INTERVAL") {
            self.update_period = parse_override("INTERVAL", &interval)?;
        }
        if let Some(sensors) = lookup("SENSORS_FILE") {
            self.sensors = Some(sensors).filter(|s| !s.trim().is_empty());
        }
        if let Some(debug) = lookup("DEBUG") {
            self.debug = truthy(&debug);
        }

        self.validate()
    }

    /// Checks the values that cannot be expressed by the types
    pub fn validate(&self) -> Result<(), ConfigError> {
        seconds("update-period", self.update_period)?;
        seconds("mqtt.timeout", self.mqtt.timeout)?;
        seconds("apcupsd.timeout", self.apcupsd.timeout)?;

        if let Some(alias) = &self.alias {
            let token = topic_token(alias);
            if !token.chars().any(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::InvalidValue {
                    field: "alias",
                    reason: format!("`{alias}` gives the topic level `{token}`"),
                });
            }
        }

        Ok(())
    }

    /// Delay between two polls
    pub fn update_period(&self) -> Duration {
        seconds("update-period", self.update_period).unwrap_or(Duration::from_secs(10))
    }

    /// Bound of one MQTT exchange
    pub fn mqtt_timeout(&self) -> Duration {
        seconds("mqtt.timeout", self.mqtt.timeout)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT))
    }

    /// Bound of one apcupsd query
    pub fn apcupsd_timeout(&self) -> Duration {
        seconds("apcupsd.timeout", self.apcupsd.timeout)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT))
    }

    /// Log verbosity, taking the debug toggle into account
    pub fn verbosity(&self) -> usize {
        if self.debug {
            self.log_verbosity.max(4)
        } else {
            self.log_verbosity
        }
    }
}
