//! # apcupsd-mqtt
//!
//! `apcupsd-mqtt` periodically reads the status of a UPS from apcupsd and publishes it to an
//! MQTT broker, along with the discovery messages of the MQTT integration of Home Assistant
//!
//!

pub use self::apcupsd::ApcupsdClient;
pub use self::apcupsd::Fetcher;
pub use self::availability::Availability;
pub use self::availability::AvailabilityTracker;
pub use self::catalog::Catalog;
pub use self::catalog::Category;
pub use self::catalog::SensorDefinition;
pub use self::configuration::Configuration;
pub use self::daemon::Daemon;
pub use self::error::{CalculationError, ConfigError, FetchError, PublishError};
pub use self::home_assistant::DeviceIdentity;
pub use self::home_assistant::DiscoveryMessage;
pub use self::mqtt::Message;
pub use self::mqtt::MqttPublisher;
pub use self::mqtt::Publisher;
pub use self::status::StatusMessage;
pub use self::status::UpsSnapshot;

/// Contains the apcupsd client
pub mod apcupsd;
/// Contains the availability tracking
pub mod availability;
/// Contains the sensor catalog
pub mod catalog;
/// Contains the configuration stuff
pub mod configuration;
/// Contains the daemon code
pub mod daemon;
/// Contains the error types
pub mod error;
/// Contains Home Assistant registration data
pub mod home_assistant;
/// Contains the MQTT publisher
pub mod mqtt;
/// Contains the status that is sent to MQTT
pub mod status;
