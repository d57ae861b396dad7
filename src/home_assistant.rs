use crate::catalog::SensorDefinition;
use crate::error::ConfigError;
use crate::mqtt::Message;
use crate::status::UpsSnapshot;
use convert_case::{Case, Casing};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Manufacturer announced for every UPS
pub const MANUFACTURER: &str = "APC";

/// Payload of the availability topic when the UPS answers
pub const PAYLOAD_AVAILABLE: &str = "online";

/// Payload of the availability topic when the UPS cannot be reached
pub const PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Payload fields that sensor definitions cannot override
const PROTECTED_FIELDS: [&str; 3] = ["device", "unique_id", "state_topic"];

/// Identity of the monitored UPS, shared by every discovery message
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub serial_no: String,
    pub alias: String,
    pub model: String,
    pub firmware: String,
}

/// Turns a free-form name into a token usable as a topic level
///
/// ```
/// use apcupsd_mqtt::home_assistant::topic_token;
///
/// assert_eq!(topic_token("Rack UPS"), "rack_ups");
/// assert_eq!(topic_token("ups1"), "ups1");
/// ```
pub fn topic_token(name: &str) -> String {
    name.trim()
        .from_case(Case::Title)
        .to_case(Case::Snake)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl DeviceIdentity {
    /// Reads the identity from a snapshot
    ///
    /// The alias defaults to the serial number. Both are normalized with [`topic_token`].
    ///
    /// ## Example
    ///
    /// ```
    /// use apcupsd_mqtt::{DeviceIdentity, UpsSnapshot};
    ///
    /// let snapshot = UpsSnapshot::from_iter([("SERIALNO", "AS1231"), ("MODEL", "Back-UPS")]);
    /// let identity = DeviceIdentity::from_snapshot(&snapshot, None);
    ///
    /// assert_eq!(identity.serial_no, "AS1231");
    /// assert_eq!(identity.alias, "as1231");
    /// ```
    pub fn from_snapshot(snapshot: &UpsSnapshot, alias: Option<&str>) -> DeviceIdentity {
        let present = |key: &str| snapshot.get(key).filter(|s| !s.trim().is_empty());
        let serial_no = present("SERIALNO")
            .or_else(|| present("UPSNAME"))
            .unwrap_or("unknown")
            .trim()
            .to_string();
        let field = |key: &str| snapshot.get(key).unwrap_or_default().trim().to_string();

        DeviceIdentity {
            alias: topic_token(alias.unwrap_or(&serial_no)),
            model: field("MODEL"),
            firmware: field("FIRMWARE"),
            serial_no,
        }
    }

    /// Identifier of the device in Home Assistant
    pub fn device_id(&self) -> String {
        format!("apc_ups_{}", self.serial_no)
    }

    /// Prefix of the entity names and the per-device discovery level
    pub fn entity_prefix(&self) -> String {
        format!("apc_ups_{}", self.alias)
    }
}

/// MQTT topics used for one UPS
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    /// Discovery prefix configured in Home Assistant
    pub registration_prefix: String,

    /// Retained JSON object with every status field
    pub state: String,

    /// Retained `online`/`offline`
    pub availability: String,
}

impl Topics {
    /// ```
    /// use apcupsd_mqtt::home_assistant::Topics;
    ///
    /// let topics = Topics::new("homeassistant", "apcupsd", "ups1");
    /// assert_eq!(topics.state, "apcupsd/ups1");
    /// assert_eq!(topics.availability, "apcupsd/ups1/status");
    /// ```
    pub fn new(registration_prefix: &str, state_prefix: &str, alias: &str) -> Topics {
        Topics {
            registration_prefix: registration_prefix.to_string(),
            state: format!("{state_prefix}/{alias}"),
            availability: format!("{state_prefix}/{alias}/status"),
        }
    }
}

/// Device sent to Home Assistant
#[derive(Serialize, Debug)]
pub struct Device<'a> {
    /// Always [`DeviceIdentity::device_id`]
    identifiers: [String; 1],

    manufacturer: &'static str,

    model: &'a str,

    /// Name of the device, built from the alias
    name: String,

    /// Firmware reported by the UPS
    sw_version: &'a str,
}

/// Describes the origin of the messages, in this case `apcupsd-mqtt`
#[derive(Serialize, Debug)]
pub struct Origin {
    /// Name of the origin, always `apcupsd-mqtt`
    name: &'static str,

    /// Version of `apcupsd-mqtt`
    sw_version: &'static str,

    /// URL of `apcupsd-mqtt`
    url: &'static str,
}

impl Origin {
    fn current() -> Origin {
        Origin {
            name: env!("CARGO_PKG_NAME"),
            sw_version: env!("CARGO_PKG_VERSION"),
            url: env!("CARGO_PKG_HOMEPAGE"),
        }
    }
}

/// Generated part of a discovery payload
#[derive(Serialize, Debug)]
struct SensorPayload<'a> {
    /// Shown in Home Assistant and converted into the entity ID
    name: String,

    unique_id: String,

    state_topic: &'a str,

    /// Tells Home Assistant where to find the value in the JSON state
    value_template: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    availability_topic: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    payload_available: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    payload_not_available: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,

    /// See <https://www.home-assistant.io/integrations/sensor#device-class> for possible values here
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,

    device: Device<'a>,

    origin: Origin,
}

/// Retained message that registers one sensor in Home Assistant
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: Map<String, Value>,
    pub retain: bool,
}

impl DiscoveryMessage {
    /// Converts to a message ready to be published
    pub fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: Value::Object(self.payload.clone()).to_string(),
            retain: self.retain,
        }
    }
}

impl fmt::Display for DiscoveryMessage {
    /// Formats the payload in JSON format
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(payload) = serde_json::to_string(&self.payload) else {
            return Err(fmt::Error);
        };
        write!(f, "{payload}")
    }
}

/// Template extracting `query_key` from the JSON state
pub fn value_template(query_key: &str) -> String {
    format!("{{{{ value_json.{} }}}}", query_key.to_lowercase())
}

/// Discovery topic of a sensor
pub fn discovery_topic(prefix: &str, identity: &DeviceIdentity, sensor: &SensorDefinition) -> String {
    format!(
        "{prefix}/{}/{}/{}/config",
        sensor.category,
        identity.entity_prefix(),
        sensor.query_key
    )
}

/// Merges `extra` into `payload`
///
/// Extra fields replace generated ones, except for [`PROTECTED_FIELDS`].
pub fn merge_payload(payload: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (key, value) in extra {
        if PROTECTED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
}

fn sensor_payload(
    identity: &DeviceIdentity,
    sensor: &SensorDefinition,
    state_topic: &str,
    availability_topic: Option<&str>,
) -> Result<Map<String, Value>, ConfigError> {
    let payload = SensorPayload {
        name: format!("{}_{}", identity.entity_prefix(), sensor.name),
        unique_id: format!("{}_{}", identity.device_id(), sensor.query_key),
        state_topic,
        value_template: value_template(&sensor.query_key),
        availability_topic,
        payload_available: availability_topic.map(|_| PAYLOAD_AVAILABLE),
        payload_not_available: availability_topic.map(|_| PAYLOAD_NOT_AVAILABLE),
        unit_of_measurement: sensor.unit.as_deref(),
        device_class: sensor.device_class.as_deref(),
        device: Device {
            identifiers: [identity.device_id()],
            manufacturer: MANUFACTURER,
            model: &identity.model,
            name: identity.entity_prefix(),
            sw_version: &identity.firmware,
        },
        origin: Origin::current(),
    };

    match serde_json::to_value(payload)? {
        Value::Object(mut map) => {
            merge_payload(&mut map, &sensor.extra_payload_fields);
            Ok(map)
        }
        other => Err(ConfigError::InvalidSensor {
            category: sensor.category.to_string(),
            name: sensor.name.clone(),
            reason: format!("payload is not an object: {other}"),
        }),
    }
}

/// Builds the discovery messages of every sensor, in the order of `sensors`
///
/// Two sensors that would share a discovery topic are rejected.
///
/// ## Example
///
/// ```
/// use apcupsd_mqtt::{Category, DeviceIdentity, SensorDefinition};
/// use apcupsd_mqtt::home_assistant::discovery_messages;
///
/// let identity = DeviceIdentity {
///     serial_no: "AS1231".into(),
///     alias: "ups1".into(),
///     model: "X".into(),
///     firmware: "Y".into(),
/// };
/// let sensors = [SensorDefinition::new(Category::Sensor, "loadpct").with_unit("%")];
///
/// let messages = discovery_messages("homeassistant", &identity, &sensors, "apcupsd/ups1", None).unwrap();
///
/// assert_eq!(messages[0].topic, "homeassistant/sensor/apc_ups_ups1/loadpct/config");
/// assert_eq!(messages[0].payload["unique_id"], "apc_ups_AS1231_loadpct");
/// ```
pub fn discovery_messages(
    prefix: &str,
    identity: &DeviceIdentity,
    sensors: &[SensorDefinition],
    state_topic: &str,
    availability_topic: Option<&str>,
) -> Result<Vec<DiscoveryMessage>, ConfigError> {
    let mut topics: HashMap<String, &SensorDefinition> = HashMap::new();
    let mut messages = Vec::with_capacity(sensors.len());

    for sensor in sensors {
        let topic = discovery_topic(prefix, identity, sensor);
        if let Some(first) = topics.insert(topic.clone(), sensor) {
            return Err(ConfigError::DuplicateTopic {
                topic,
                first: first.to_string(),
                second: sensor.to_string(),
            });
        }

        messages.push(DiscoveryMessage {
            payload: sensor_payload(identity, sensor, state_topic, availability_topic)?,
            topic,
            retain: true,
        });
    }

    Ok(messages)
}
