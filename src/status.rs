use crate::error::CalculationError;
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Status field holding the nominal power of the UPS, in watts
pub const NOMINAL_POWER: &str = "NOMPOWER";

/// Status field holding the load, in percent of the nominal power
pub const LOAD_PERCENT: &str = "LOADPCT";

/// Field added to every snapshot with the instantaneous power draw, in watts
pub const WATTS: &str = "WATTS";

/// One read of all the status fields reported by apcupsd
///
/// Keys are kept as reported, usually upper case (`LOADPCT`, `SERIALNO`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsSnapshot {
    fields: BTreeMap<String, String>,
}

impl UpsSnapshot {
    pub fn new() -> UpsSnapshot {
        Default::default()
    }

    /// Value of a status field
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Value of a status field, parsed as a number
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UpsSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        UpsSnapshot {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Formats a number the way apcupsd formats its own: integral values keep one decimal
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Instantaneous power draw in watts: nominal power × load / 100
///
/// Missing or non-numeric inputs count as `0.0`.
///
/// ## Example
///
/// ```
/// use apcupsd_mqtt::UpsSnapshot;
/// use apcupsd_mqtt::status::power_watts;
///
/// let snapshot = UpsSnapshot::from_iter([("NOMPOWER", "865.0"), ("LOADPCT", "20.0")]);
///
/// assert_eq!(power_watts(&snapshot), Ok(173.0));
/// ```
pub fn power_watts(snapshot: &UpsSnapshot) -> Result<f64, CalculationError> {
    let nominal = snapshot.get_f64(NOMINAL_POWER).unwrap_or(0.0);
    let load = snapshot.get_f64(LOAD_PERCENT).unwrap_or(0.0);
    let watts = nominal * load / 100.0;

    if !watts.is_finite() {
        return Err(CalculationError {
            field: WATTS,
            reason: format!("{NOMINAL_POWER}={nominal} {LOAD_PERCENT}={load} gives {watts}"),
        });
    }
    Ok(watts)
}

/// Returns the snapshot with the derived fields added
///
/// A derived field that cannot be computed is logged and left out, the other fields are kept.
pub fn with_derived_metrics(snapshot: &UpsSnapshot) -> UpsSnapshot {
    let mut snapshot = snapshot.clone();
    match power_watts(&snapshot) {
        Ok(watts) => snapshot.insert(WATTS, format_number(watts)),
        Err(e) => warn!("Derived metric skipped: {e}"),
    }
    snapshot
}

/// Message sent to the state topic, which Home Assistant reads through the value templates
///
/// This contains every status field with a lower-cased key.
#[derive(Serialize, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct StatusMessage {
    pub fields: BTreeMap<String, String>,
}

impl From<&UpsSnapshot> for StatusMessage {
    fn from(snapshot: &UpsSnapshot) -> StatusMessage {
        StatusMessage {
            fields: snapshot
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for StatusMessage {
    /// Formats the message to a JSON string
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(str) = serde_json::to_string(&self) else {
            return Err(fmt::Error);
        };
        write!(f, "{str}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;

    #[test]
    fn test_power() {
        let snapshot = UpsSnapshot::from_iter([(NOMINAL_POWER, "865.0"), (LOAD_PERCENT, "20.0")]);
        assert_eq!(power_watts(&snapshot), Ok(173.0));

        let derived = with_derived_metrics(&snapshot);
        assert_eq!(derived.get(WATTS), Some("173.0"));
        assert_eq!(derived.len(), 3);
    }

    #[test]
    fn test_missing_inputs() {
        let snapshot = UpsSnapshot::from_iter([(LOAD_PERCENT, "20.0")]);
        assert_eq!(power_watts(&snapshot), Ok(0.0));
        assert_eq!(with_derived_metrics(&snapshot).get(WATTS), Some("0.0"));

        let snapshot = UpsSnapshot::new();
        assert_eq!(with_derived_metrics(&snapshot).get(WATTS), Some("0.0"));
    }

    #[test]
    fn test_non_numeric_inputs() {
        let snapshot = UpsSnapshot::from_iter([(NOMINAL_POWER, "865 Watts"), (LOAD_PERCENT, "20.0")]);
        assert_eq!(power_watts(&snapshot), Ok(0.0));
    }

    #[test]
    fn test_non_finite_power_is_skipped() {
        let snapshot = UpsSnapshot::from_iter([
            (NOMINAL_POWER, "inf"),
            (LOAD_PERCENT, "20.0"),
            ("STATUS", "ONLINE"),
        ]);
        assert!(power_watts(&snapshot).is_err());

        let derived = with_derived_metrics(&snapshot);
        assert_eq!(derived, snapshot);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(173.0), "173.0");
        assert_eq!(format_number(0.0), "0.0");
        assert_eq!(format_number(203.275), "203.275");
    }

    #[test]
    fn test_status_message() {
        let snapshot = UpsSnapshot::from_iter([
            ("STATUS", "ONLINE"),
            ("LOADPCT", "20.0"),
            ("SERIALNO", "AS1231"),
        ]);
        let status = StatusMessage::from(&with_derived_metrics(&snapshot));
        let json: HashMap<String, Value> =
            serde_json::from_str(&status.to_string()).expect("Cannot read status");

        assert_eq!(json.len(), snapshot.len() + 1);
        for (key, value) in snapshot.iter() {
            assert_eq!(json[&key.to_lowercase()], Value::from(value));
        }
        assert_eq!(json["watts"], Value::from("0.0"));
    }

    #[test]
    fn test_status_message_order() {
        let snapshot = UpsSnapshot::from_iter([("STATUS", "ONLINE"), ("BCHARGE", "100.0")]);

        assert_eq!(
            StatusMessage::from(&snapshot).to_string(),
            r#"{"bcharge":"100.0","status":"ONLINE"}"#
        );
    }
}
