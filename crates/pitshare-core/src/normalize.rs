//! Telemetry and session reduction for the wire
//!
//! The simulator hands us records with hundreds of variables, most of them
//! wrapped as `{ "value": [x, ...] }`. Guests only need a few dozen scalars, so
//! the host filters against a fixed whitelist and peels the wrappers before
//! anything goes on the network.
//!
//! Everything here is pure: inputs are borrowed, never mutated, and filtering
//! an already filtered record returns it unchanged.

use serde_json::{Map, Value};

use crate::config::{DEFAULT_MAX_DRIVERS, DEFAULT_UNWRAP_DEPTH};
use crate::sync::protocol::{DriverInfo, SessionFrame, TelemetryFrame};

/// Full-fidelity telemetry record as delivered by the telemetry source
pub type TelemetryRecord = Map<String, Value>;

/// Telemetry variables shared with teammates
pub const TELEMETRY_WHITELIST: &[&str] = &[
    "FuelLevel",
    "FuelLevelPct",
    "Lap",
    "LapDistPct",
    "SessionLapsRemain",
    "SessionTimeRemain",
    "SessionTimeTotal",
    "SessionFlags",
    "SessionTime",
    "SessionNum",
    "SessionState",
    "SessionLaps",
    "SessionLapsTotal",
    "SessionTotalLaps",
    "OnPitRoad",
    "IsOnTrack",
    "DriverCarIdx",
    "TeamID",
    "Speed",
    "RPM",
    "Gear",
    "LapBestLapTime",
    "LapLastLapTime",
    "LapCurrentLapTime",
    "SessionUniqueID",
    "CamCarIdx",
    "DriverCarFuelMaxLtr",
    "DriverCarMaxFuelPct",
    "CarIdxLap",
    "CarIdxLapDistPct",
    "CarIdxOnPitRoad",
    "CarsIdxLastLapTime",
    "AirTemp",
    "TrackTemp",
    "RelativeHumidity",
    "AirPressure",
    "WindVel",
    "WindDir",
    "CarIdxPosition",
    "CarIdxClassPosition",
    "CarIdxEstTime",
    "PlayerCarTowTime",
];

/// Canonical total-laps field read by the fuel calculator
pub const LAPS_TOTAL_FIELD: &str = "SessionLaps";

/// Names other producers use for the total-laps field, in preference order
pub const LAPS_TOTAL_ALIASES: &[&str] = &["SessionLapsTotal", "SessionTotalLaps"];

/// The closed set of value shapes the peeler understands
enum Shape<'a> {
    /// `null`: the variable has no value
    Missing,
    /// An object carrying a `value` key
    Wrapper(&'a Value),
    /// A non-empty array; only the first element is kept
    Sequence(&'a Value),
    /// Anything else ends peeling
    Terminal,
}

impl<'a> Shape<'a> {
    fn of(value: &'a Value) -> Self {
        match value {
            Value::Null => Shape::Missing,
            Value::Object(map) => match map.get("value") {
                Some(inner) => Shape::Wrapper(inner),
                None => Shape::Terminal,
            },
            Value::Array(items) => match items.first() {
                Some(first) => Shape::Sequence(first),
                None => Shape::Terminal,
            },
            _ => Shape::Terminal,
        }
    }
}

/// Peel wrapper objects and sequences until a terminal value is reached
///
/// Peeling stops once the depth exceeds `max_depth`, so at most
/// `max_depth + 1` layers are removed; whatever remains after that is
/// returned as-is. Returns `None` when the innermost value is `null`.
pub fn peel(value: &Value, max_depth: usize) -> Option<Value> {
    let mut current = value;
    for _ in 0..=max_depth {
        match Shape::of(current) {
            Shape::Missing => return None,
            Shape::Wrapper(inner) | Shape::Sequence(inner) => current = inner,
            Shape::Terminal => break,
        }
    }
    match current {
        Value::Null => None,
        other => Some(other.clone()),
    }
}

/// Stateless telemetry/session reducer
#[derive(Debug, Clone, Copy)]
pub struct DataNormalizer {
    max_drivers: usize,
    unwrap_depth: usize,
}

impl Default for DataNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DRIVERS, DEFAULT_UNWRAP_DEPTH)
    }
}

impl DataNormalizer {
    pub fn new(max_drivers: usize, unwrap_depth: usize) -> Self {
        Self {
            max_drivers,
            unwrap_depth,
        }
    }

    /// Reduce a full telemetry record to the whitelisted, flattened frame
    ///
    /// If the canonical total-laps field is missing but one of its aliases is
    /// present, the alias value is copied into the canonical field.
    pub fn filter_telemetry(&self, full: &TelemetryRecord) -> TelemetryFrame {
        let mut frame = TelemetryFrame::new();

        for &key in TELEMETRY_WHITELIST {
            if let Some(raw) = full.get(key) {
                if let Some(value) = peel(raw, self.unwrap_depth) {
                    frame.insert(key.to_string(), value);
                }
            }
        }

        if !frame.contains_key(LAPS_TOTAL_FIELD) {
            let alias = LAPS_TOTAL_ALIASES
                .iter()
                .find_map(|alias| frame.get(*alias).cloned());
            if let Some(total) = alias {
                frame.insert(LAPS_TOTAL_FIELD.to_string(), total);
            }
        }

        frame
    }

    /// Reduce a full session record to the shared sections
    ///
    /// The driver list is truncated to `max_drivers`, keeping simulator order.
    /// Non-object input yields an empty frame.
    pub fn filter_session(&self, full: &Value) -> SessionFrame {
        let Some(sections) = full.as_object() else {
            return SessionFrame::default();
        };

        let driver_info = sections
            .get("DriverInfo")
            .and_then(Value::as_object)
            .map(|info| self.filter_driver_info(info));

        SessionFrame {
            weekend_info: non_null(sections.get("WeekendInfo")),
            driver_info,
            session_info: non_null(sections.get("SessionInfo")),
        }
    }

    fn filter_driver_info(&self, info: &Map<String, Value>) -> DriverInfo {
        let mut rest = info.clone();
        let drivers = match rest.remove("Drivers") {
            Some(Value::Array(mut drivers)) => {
                drivers.truncate(self.max_drivers);
                Some(drivers)
            }
            Some(Value::Null) | None => None,
            Some(other) => {
                // Keep malformed driver lists visible rather than dropping them
                rest.insert("Drivers".to_string(), other);
                None
            }
        };
        DriverInfo { drivers, rest }
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> TelemetryRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_peel_wrapper_and_sequence() {
        assert_eq!(peel(&json!({"value": [12.5, 3.0]}), 5), Some(json!(12.5)));
        assert_eq!(peel(&json!([[[7]]]), 5), Some(json!(7)));
        assert_eq!(peel(&json!("Green"), 5), Some(json!("Green")));
    }

    #[test]
    fn test_peel_terminal_shapes() {
        // Empty arrays and objects without `value` are kept as-is
        assert_eq!(peel(&json!([]), 5), Some(json!([])));
        assert_eq!(peel(&json!({"other": 1}), 5), Some(json!({"other": 1})));
        assert_eq!(peel(&json!({"value": null}), 5), None);
        assert_eq!(peel(&Value::Null, 5), None);
    }

    #[test]
    fn test_peel_respects_depth_cap() {
        let deep = json!({"value": {"value": {"value": 1}}});
        assert_eq!(peel(&deep, 1), Some(json!({"value": 1})));
        assert_eq!(peel(&deep, 2), Some(json!(1)));
        assert_eq!(peel(&deep, 0), Some(json!({"value": {"value": 1}})));

        // Three `{"value": [..]}` wrappers are six layers, all peeled at depth 5
        let wrapped = json!({"value": [{"value": [{"value": [42.0]}]}]});
        assert_eq!(peel(&wrapped, 5), Some(json!(42.0)));
        let seven = json!([[[[[[[42.0]]]]]]]);
        assert_eq!(peel(&seven, 5), Some(json!([42.0])));
    }

    #[test]
    fn test_filter_drops_unlisted_fields() {
        let full = record(json!({
            "FuelLevel": {"value": [41.2]},
            "SteeringWheelAngle": {"value": [0.1]},
            "Gear": {"value": [3]},
        }));
        let frame = DataNormalizer::default().filter_telemetry(&full);

        assert_eq!(frame.len(), 2);
        assert_eq!(frame["FuelLevel"], json!(41.2));
        assert_eq!(frame["Gear"], json!(3));
        assert!(!frame.contains_key("SteeringWheelAngle"));
    }

    #[test]
    fn test_alias_fills_canonical_laps() {
        let full = record(json!({"SessionTotalLaps": {"value": [17]}}));
        let frame = DataNormalizer::default().filter_telemetry(&full);
        assert_eq!(frame[LAPS_TOTAL_FIELD], json!(17));
        assert_eq!(frame["SessionTotalLaps"], json!(17));
    }

    #[test]
    fn test_canonical_laps_wins_over_alias() {
        let full = record(json!({"SessionLaps": 30, "SessionLapsTotal": 99}));
        let frame = DataNormalizer::default().filter_telemetry(&full);
        assert_eq!(frame[LAPS_TOTAL_FIELD], json!(30));
    }

    #[test]
    fn test_filter_telemetry_does_not_mutate_input() {
        let full = record(json!({"Speed": {"value": [55.0]}}));
        let before = full.clone();
        let _ = DataNormalizer::default().filter_telemetry(&full);
        assert_eq!(full, before);
    }

    #[test]
    fn test_filter_session_caps_drivers() {
        let drivers: Vec<Value> = (0..150).map(|i| json!({"CarIdx": i})).collect();
        let full = json!({
            "WeekendInfo": {"SessionID": 5},
            "DriverInfo": {"DriverCarIdx": 3, "Drivers": drivers},
            "SessionInfo": {"Sessions": []},
            "SplitTimeInfo": {"Sectors": []},
        });

        let frame = DataNormalizer::default().filter_session(&full);
        let info = frame.driver_info.unwrap();
        let kept = info.drivers.unwrap();
        assert_eq!(kept.len(), 100);
        assert_eq!(kept[0]["CarIdx"], json!(0));
        assert_eq!(kept[99]["CarIdx"], json!(99));
        assert_eq!(info.rest["DriverCarIdx"], json!(3));
        assert!(frame.weekend_info.is_some());
        assert!(frame.session_info.is_some());
    }

    #[test]
    fn test_filter_session_is_idempotent() {
        let drivers: Vec<Value> = (0..120).map(|i| json!({"CarIdx": i})).collect();
        let full = json!({"DriverInfo": {"Drivers": drivers}, "CameraInfo": {}});
        let normalizer = DataNormalizer::default();

        let once = normalizer.filter_session(&full);
        let twice = normalizer.filter_session(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_filter_session_non_object() {
        let frame = DataNormalizer::default().filter_session(&json!([1, 2]));
        assert_eq!(frame, SessionFrame::default());
    }
}
