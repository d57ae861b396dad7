use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use strum_macros::{Display, EnumIter};

/// Catalog used when no sensor file is configured
pub const DEFAULT_CATALOG: &str = include_str!("../conf/sensors.toml");

/// Home Assistant platform of a sensor
///
/// The declaration order gives the order of the discovery messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    /// On/off entity
    BinarySensor,

    /// Entity reporting a value
    Sensor,
}

/// One sensor announced to Home Assistant
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDefinition {
    /// Platform of the entity
    pub category: Category,

    /// Name of the sensor, unique within its category
    pub name: String,

    /// Lower-cased status field read by the sensor. Defaults to `name`
    pub query_key: String,

    /// Unit sent as `unit_of_measurement`
    pub unit: Option<String>,

    /// Home Assistant device class
    pub device_class: Option<String>,

    /// Fields merged as is into the discovery payload
    pub extra_payload_fields: Map<String, Value>,
}

/// Ordered set of sensor definitions
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sensors: Vec<SensorDefinition>,
}

/// Body of a catalog entry, every field is optional
#[derive(Deserialize)]
struct SensorEntry {
    key: Option<String>,

    #[serde(alias = "unit")]
    unit_of_measurement: Option<String>,

    device_class: Option<String>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    binary_sensor: BTreeMap<String, SensorEntry>,

    #[serde(default)]
    sensor: BTreeMap<String, SensorEntry>,
}

/// Lower-cases `token` and checks that it can be used as a topic level and a template attribute
fn normalize(category: Category, name: &str, token: &str) -> Result<String, ConfigError> {
    let token = token.trim().to_ascii_lowercase();
    let invalid = |reason: String| ConfigError::InvalidSensor {
        category: category.to_string(),
        name: name.to_string(),
        reason,
    };

    if token.is_empty() {
        return Err(invalid(String::from("empty key")));
    }
    if let Some(c) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(invalid(format!("`{token}` contains `{c}`")));
    }
    Ok(token)
}

impl SensorDefinition {
    /// Creates a definition with no unit, device class or extra field
    ///
    /// ## Example
    ///
    /// ```
    /// use apcupsd_mqtt::{Category, SensorDefinition};
    ///
    /// let sensor = SensorDefinition::new(Category::Sensor, "loadpct");
    /// assert_eq!(sensor.query_key, "loadpct");
    /// ```
    pub fn new(category: Category, name: &str) -> SensorDefinition {
        SensorDefinition {
            category,
            name: name.to_string(),
            query_key: name.to_ascii_lowercase(),
            unit: None,
            device_class: None,
            extra_payload_fields: Map::new(),
        }
    }

    /// Sets the unit of measurement
    pub fn with_unit(mut self, unit: &str) -> SensorDefinition {
        self.unit = Some(unit.to_string());
        self
    }

    /// Reads another status field than the one named after the sensor
    pub fn with_query_key(mut self, key: &str) -> SensorDefinition {
        self.query_key = key.to_ascii_lowercase();
        self
    }

    fn from_entry(
        category: Category,
        name: &str,
        entry: SensorEntry,
    ) -> Result<SensorDefinition, ConfigError> {
        let name_key = normalize(category, name, name)?;
        let query_key = match entry.key.as_deref() {
            Some(key) => normalize(category, name, key)?,
            None => name_key.clone(),
        };

        Ok(SensorDefinition {
            category,
            name: name_key,
            query_key,
            unit: entry.unit_of_measurement,
            device_class: entry.device_class,
            extra_payload_fields: entry.extra,
        })
    }
}

impl fmt::Display for SensorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.name)
    }
}

impl Catalog {
    /// Loads the catalog from a file, or the built-in catalog when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Catalog, ConfigError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::parse(&text, &path.display().to_string())
            }
            None => Self::parse(DEFAULT_CATALOG, "built-in sensor catalog"),
        }
    }

    /// Parses a catalog from its TOML text
    ///
    /// ## Example
    ///
    /// ```
    /// use apcupsd_mqtt::Catalog;
    ///
    /// let catalog = Catalog::parse("[sensor.bcharge]\nunit = \"%\"\n", "example").unwrap();
    ///
    /// assert_eq!(catalog.sensors()[0].unit.as_deref(), Some("%"));
    /// ```
    pub fn parse(text: &str, origin: &str) -> Result<Catalog, ConfigError> {
        let file: CatalogFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;

        let mut sensors = Vec::new();
        for (category, entries) in [
            (Category::BinarySensor, file.binary_sensor),
            (Category::Sensor, file.sensor),
        ] {
            for (name, entry) in entries {
                sensors.push(SensorDefinition::from_entry(category, &name, entry)?);
            }
        }

        Self::from_definitions(sensors)
    }

    /// Builds a catalog from definitions, sorting them and rejecting duplicates
    pub fn from_definitions(mut sensors: Vec<SensorDefinition>) -> Result<Catalog, ConfigError> {
        sensors.sort_by(|a, b| (a.category, &a.name).cmp(&(b.category, &b.name)));

        {
            let mut seen: HashMap<(Category, &str), &SensorDefinition> = HashMap::new();
            for sensor in &sensors {
                if let Some(first) = seen.insert((sensor.category, sensor.query_key.as_str()), sensor) {
                    return Err(ConfigError::DuplicateTopic {
                        topic: format!("{}/{}", sensor.category, sensor.query_key),
                        first: first.to_string(),
                        second: sensor.to_string(),
                    });
                }
            }
        }

        Ok(Catalog { sensors })
    }

    /// Sensors ordered by category, then name
    pub fn sensors(&self) -> &[SensorDefinition] {
        &self.sensors
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    #[test]
    fn test_builtin_catalog() -> Result<(), ConfigError> {
        let catalog = Catalog::load(None)?;

        assert!(!catalog.is_empty());

        let online = &catalog.sensors()[0];
        assert_eq!(online.category, Category::BinarySensor);
        assert_eq!(online.name, "online");
        assert_eq!(online.query_key, "status");
        assert!(online.extra_payload_fields.contains_key("value_template"));

        let watts = catalog
            .sensors()
            .iter()
            .find(|s| s.name == "watts")
            .expect("watts sensor not found");
        assert_eq!(watts.unit.as_deref(), Some("W"));
        assert_eq!(watts.device_class.as_deref(), Some("power"));
        assert_eq!(watts.extra_payload_fields["state_class"], json!("measurement"));

        Ok(())
    }

    #[test]
    fn test_catalog_file_matches_builtin() -> Result<(), ConfigError> {
        let file = Catalog::load(Some(Path::new("conf/sensors.toml")))?;
        let builtin = Catalog::load(None)?;

        assert_eq!(file.sensors(), builtin.sensors());

        Ok(())
    }

    #[test]
    fn test_ordering() -> Result<(), ConfigError> {
        let catalog = Catalog::parse(
            r#"
            [sensor.timeleft]
            [sensor.bcharge]
            [binary_sensor.online]
            key = "status"
            "#,
            "test",
        )?;

        let names: Vec<String> = catalog.sensors().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            ["binary_sensor.online", "sensor.bcharge", "sensor.timeleft"]
        );

        let categories: Vec<Category> = Category::iter().collect();
        assert_eq!(categories, [Category::BinarySensor, Category::Sensor]);

        Ok(())
    }

    #[test]
    fn test_empty_body_defaults() -> Result<(), ConfigError> {
        let catalog = Catalog::parse("sensor.LINEV = {}\n", "test")?;
        let sensor = &catalog.sensors()[0];

        assert_eq!(sensor.name, "linev");
        assert_eq!(sensor.query_key, "linev");
        assert_eq!(sensor.unit, None);
        assert!(sensor.extra_payload_fields.is_empty());

        Ok(())
    }

    #[test]
    fn test_override_key() -> Result<(), ConfigError> {
        let catalog = Catalog::parse("[sensor.power]\nkey = \"WATTS\"\nicon = \"mdi:flash\"\n", "test")?;
        let sensor = &catalog.sensors()[0];

        assert_eq!(sensor.name, "power");
        assert_eq!(sensor.query_key, "watts");
        assert_eq!(sensor.extra_payload_fields.len(), 1);
        assert_eq!(sensor.extra_payload_fields["icon"], json!("mdi:flash"));

        Ok(())
    }

    #[test]
    fn test_duplicate_query_key() {
        let result = Catalog::parse(
            "[sensor.power]\nkey = \"watts\"\n[sensor.watts]\n",
            "test",
        );

        assert!(matches!(result, Err(ConfigError::DuplicateTopic { .. })));
    }

    #[test]
    fn test_same_key_in_two_categories() -> Result<(), ConfigError> {
        let catalog = Catalog::parse(
            "[sensor.status]\n[binary_sensor.online]\nkey = \"status\"\n",
            "test",
        )?;

        assert_eq!(catalog.len(), 2);

        Ok(())
    }

    #[test]
    fn test_invalid_key() {
        let result = Catalog::parse("[sensor.load]\nkey = \"load/pct\"\n", "test");
        assert!(matches!(result, Err(ConfigError::InvalidSensor { .. })));

        let result = Catalog::parse("[sensor.load]\nkey = \"\"\n", "test");
        assert!(matches!(result, Err(ConfigError::InvalidSensor { .. })));
    }

    #[test]
    fn test_unknown_category() {
        let result = Catalog::parse("[switch.relay]\n", "test");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
