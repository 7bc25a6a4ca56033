//! Translation between MQTT-facing keys and appliance wire fields.
//!
//! Temperatures travel as hundredths of a degree ("6500" = 65 °C), modes
//! and power limits as the appliance's own enum strings.

use serde_json::{Value, json};
use tracing::warn;

use super::{FieldMap, StatusObject, wire_string};

/// A derived state value, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub key: &'static str,
    pub value: String,
}

struct Setpoint {
    key: &'static str,
    field: &'static str,
    min: f64,
    max: f64,
}

const SETPOINTS: [Setpoint; 4] = [
    Setpoint { key: "co_temperature", field: "BoilerTempCmd", min: 20.0, max: 69.0 },
    Setpoint { key: "co_hysteresis", field: "BoilerHist", min: 0.0, max: 6.0 },
    Setpoint { key: "dhw_temperature", field: "DHWTempCmd", min: 30.0, max: 69.0 },
    Setpoint { key: "dhw_hysteresis", field: "DHWHist", min: 0.0, max: 6.0 },
];

/// Power limit percentage ↔ `BuModulMax` step.
const POWER_STEPS: [(&str, &str); 3] = [("33", "0"), ("67", "1"), ("100", "2")];

/// MQTT `dhw_mode` value ↔ `DHWMode` wire value.
const DHW_MODES: [(&str, &str); 3] = [("on", "Still_On"), ("stop", "Stop"), ("priority", "Priority")];

/// Keys whose value changes continuously and should not be retained.
pub const VOLATILE_KEYS: [&str; 1] = ["power_status"];

fn temp_to_wire(celsius: f64) -> String {
    ((celsius * 100.0).round() as i64).to_string()
}

fn wire_to_temp(value: &Value) -> Option<f64> {
    let hundredths: i64 = wire_string(value).trim().parse().ok()?;
    Some(hundredths as f64 / 100.0)
}

fn format_number(v: f64) -> String {
    // 65.0 → "65", 65.5 → "65.5"
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Build a command request from an MQTT key and payload.
///
/// `current` is the last status seen from the appliance; `dhw_mode=heat`
/// uses it to keep an active priority mode.
/// Returns `None` (after logging) for unknown keys and unusable payloads.
pub fn build_command(key: &str, payload: &str, current: Option<&StatusObject>) -> Option<FieldMap> {
    let payload = payload.trim();
    let (field, value) = match key {
        "co_max_power" => {
            let step = POWER_STEPS
                .iter()
                .find(|(percent, _)| *percent == payload.trim_end_matches('%'))
                .map(|(_, step)| *step);
            let Some(step) = step else {
                warn!("Invalid power limit for {}: {} (expected 33, 67 or 100)", key, payload);
                return None;
            };
            ("BuModulMax", step)
        }
        "co_mode" => {
            let mode = match payload.to_ascii_lowercase().as_str() {
                "heat" | "on" | "true" | "1" => "Still_On",
                "off" | "false" | "0" => "Stop",
                _ => {
                    warn!("Invalid mode for {}: {}", key, payload);
                    return None;
                }
            };
            ("CH1Mode", mode)
        }
        "dhw_mode" => {
            let lowered = payload.to_ascii_lowercase();
            let lowered = match lowered.as_str() {
                "off" => "stop".to_string(),
                "heat" => {
                    let priority = current
                        .and_then(|status| status.get("DHWMode"))
                        .is_some_and(|mode| wire_string(mode) == "Priority");
                    let name = if priority { "priority" } else { "on" };
                    name.to_string()
                }
                _ => lowered,
            };
            let Some((_, mode)) = DHW_MODES.iter().find(|(name, _)| *name == lowered) else {
                warn!("Invalid mode for {}: {}", key, payload);
                return None;
            };
            ("DHWMode", *mode)
        }
        _ => {
            let Some(setpoint) = SETPOINTS.iter().find(|s| s.key == key) else {
                warn!("Unknown command key: {}", key);
                return None;
            };
            let celsius: f64 = match payload.parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Invalid number for {}: {}", key, payload);
                    return None;
                }
            };
            if !(setpoint.min..=setpoint.max).contains(&celsius) {
                warn!(
                    "Value {} for {} outside {}..={}",
                    celsius, key, setpoint.min, setpoint.max
                );
                return None;
            }
            let mut fields = FieldMap::new();
            fields.insert(setpoint.field.to_string(), json!(temp_to_wire(celsius)));
            return Some(fields);
        }
    };

    let mut fields = FieldMap::new();
    fields.insert(field.to_string(), json!(value));
    Some(fields)
}

/// Current heater power as a percentage.
///
/// Prefers the digits embedded in `DevStatus`, then falls back to 0 when
/// heating is stopped, then to the configured power limit.
fn power_percent(status: &StatusObject) -> Option<u32> {
    if let Some(Value::String(dev_status)) = status.get("DevStatus") {
        if let Some(digits) = dev_status.get(3..6) {
            if digits.bytes().all(|b| b.is_ascii_digit()) {
                return digits.parse().ok();
            }
        }
    }

    if status.get("CH1Mode").and_then(Value::as_str) == Some("Stop") {
        return Some(0);
    }

    let step = wire_string(status.get("BuModulMax")?);
    POWER_STEPS
        .iter()
        .find(|(_, s)| *s == step.trim())
        .and_then(|(percent, _)| percent.parse().ok())
}

/// Derive the published state values from a status snapshot.
/// Fields missing from the snapshot produce no update.
pub fn state_updates(status: &StatusObject) -> Vec<StateUpdate> {
    let mut updates = Vec::new();
    let mut push = |key: &'static str, value: Option<String>| {
        if let Some(value) = value {
            updates.push(StateUpdate { key, value });
        }
    };

    let temp = |field: &str| status.get(field).and_then(wire_to_temp).map(format_number);
    push("co_current_temperature", temp("BoilerTempAct"));
    push("dhw_current_temperature", temp("DHWTempAct"));
    for setpoint in &SETPOINTS {
        push(setpoint.key, temp(setpoint.field));
    }

    push(
        "co_mode",
        status
            .get("CH1Mode")
            .map(wire_string)
            .map(|mode| if mode == "Stop" { "off" } else { "heat" }.to_string()),
    );
    push(
        "dhw_mode",
        status.get("DHWMode").map(wire_string).and_then(|mode| {
            DHW_MODES
                .iter()
                .find(|(_, wire)| *wire == mode)
                .map(|(name, _)| name.to_string())
        }),
    );
    push(
        "co_max_power",
        status.get("BuModulMax").map(wire_string).and_then(|step| {
            POWER_STEPS
                .iter()
                .find(|(_, s)| *s == step.trim())
                .map(|(percent, _)| percent.to_string())
        }),
    );
    push("power_status", power_percent(status).map(|p| p.to_string()));
    push(
        "energy_kwh",
        status
            .get("P033")
            .and_then(|v| wire_string(v).trim().parse::<f64>().ok())
            .map(format_number),
    );

    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(v: Value) -> StatusObject {
        v.as_object().cloned().unwrap()
    }

    fn lookup<'a>(updates: &'a [StateUpdate], key: &str) -> Option<&'a str> {
        updates
            .iter()
            .find(|u| u.key == key)
            .map(|u| u.value.as_str())
    }

    #[test]
    fn test_temperature_commands() {
        let fields = build_command("co_temperature", "65", None).unwrap();
        assert_eq!(fields["BoilerTempCmd"], json!("6500"));

        let fields = build_command("dhw_temperature", "47.5", None).unwrap();
        assert_eq!(fields["DHWTempCmd"], json!("4750"));

        let fields = build_command("co_hysteresis", "2", None).unwrap();
        assert_eq!(fields["BoilerHist"], json!("200"));
    }

    #[test]
    fn test_temperature_range_is_enforced() {
        assert!(build_command("co_temperature", "19", None).is_none());
        assert!(build_command("dhw_temperature", "70", None).is_none());
        assert!(build_command("dhw_hysteresis", "-1", None).is_none());
        assert!(build_command("co_temperature", "warm", None).is_none());
    }

    #[test]
    fn test_mode_commands() {
        assert_eq!(build_command("co_mode", "off", None).unwrap()["CH1Mode"], json!("Stop"));
        assert_eq!(build_command("co_mode", "heat", None).unwrap()["CH1Mode"], json!("Still_On"));
        assert_eq!(build_command("dhw_mode", "priority", None).unwrap()["DHWMode"], json!("Priority"));
        assert_eq!(build_command("dhw_mode", "OFF", None).unwrap()["DHWMode"], json!("Stop"));
        assert!(build_command("dhw_mode", "turbo", None).is_none());
    }

    #[test]
    fn test_dhw_heat_keeps_priority() {
        let priority = status(json!({"DHWMode": "Priority"}));
        let stopped = status(json!({"DHWMode": "Stop"}));
        let heat = |current: Option<&StatusObject>| {
            build_command("dhw_mode", "heat", current).unwrap()["DHWMode"].clone()
        };

        assert_eq!(heat(Some(&priority)), json!("Priority"));
        assert_eq!(heat(Some(&stopped)), json!("Still_On"));
        assert_eq!(heat(None), json!("Still_On"));
        assert_eq!(
            build_command("dhw_mode", "on", Some(&priority)).unwrap()["DHWMode"],
            json!("Still_On")
        );
    }

    #[test]
    fn test_power_commands() {
        assert_eq!(build_command("co_max_power", "67", None).unwrap()["BuModulMax"], json!("1"));
        assert_eq!(build_command("co_max_power", "100%", None).unwrap()["BuModulMax"], json!("2"));
        assert!(build_command("co_max_power", "50", None).is_none());
    }

    #[test]
    fn test_unknown_key() {
        assert!(build_command("vPin", "0000", None).is_none());
    }

    #[test]
    fn test_state_updates() {
        let updates = state_updates(&status(json!({
            "FrameType": "SkzpData",
            "BoilerTempAct": "5312",
            "BoilerTempCmd": "6500",
            "DHWTempAct": 4410,
            "DHWHist": "250",
            "CH1Mode": "Still_On",
            "DHWMode": "Priority",
            "BuModulMax": "1",
            "P033": "1234.567",
        })));

        assert_eq!(lookup(&updates, "co_current_temperature"), Some("53.12"));
        assert_eq!(lookup(&updates, "co_temperature"), Some("65"));
        assert_eq!(lookup(&updates, "dhw_current_temperature"), Some("44.1"));
        assert_eq!(lookup(&updates, "dhw_hysteresis"), Some("2.5"));
        assert_eq!(lookup(&updates, "co_mode"), Some("heat"));
        assert_eq!(lookup(&updates, "dhw_mode"), Some("priority"));
        assert_eq!(lookup(&updates, "co_max_power"), Some("67"));
        assert_eq!(lookup(&updates, "power_status"), Some("67"));
        assert_eq!(lookup(&updates, "energy_kwh"), Some("1234.57"));
        assert_eq!(lookup(&updates, "co_hysteresis"), None);
        assert_eq!(lookup(&updates, "dhw_temperature"), None);
    }

    #[test]
    fn test_power_status_sources() {
        let from_dev_status = status(json!({"DevStatus": "ABC045XYZ", "CH1Mode": "Stop"}));
        assert_eq!(power_percent(&from_dev_status), Some(45));

        let stopped = status(json!({"DevStatus": "AB", "CH1Mode": "Stop", "BuModulMax": "2"}));
        assert_eq!(power_percent(&stopped), Some(0));

        let from_step = status(json!({"CH1Mode": "Still_On", "BuModulMax": 2}));
        assert_eq!(power_percent(&from_step), Some(100));

        assert_eq!(power_percent(&status(json!({}))), None);
    }

    #[test]
    fn test_command_round_trips_through_state() {
        let fields = build_command("dhw_temperature", "55", None).unwrap();
        let mut snapshot = status(json!({"FrameType": "SkzpData"}));
        snapshot.extend(fields);
        assert_eq!(lookup(&state_updates(&snapshot), "dhw_temperature"), Some("55"));
    }
}
