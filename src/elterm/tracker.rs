use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::{FieldMap, StatusObject, wire_string};

/// How long a command may stay unconfirmed before it is abandoned.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

const TOKEN_LEN: usize = 7;

/// The one command the server is still trying to get applied.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub fields: FieldMap,
    pub token: String,
    pub issued_at: Instant,
}

#[derive(Debug, Default)]
pub enum Tracker {
    #[default]
    Idle,
    Pending(PendingCommand),
}

#[derive(Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing was pending; publish the status as received.
    Idle,
    /// Every pending field matches. State is back to idle.
    Confirm { token: String },
    /// At least one field differs. `display` carries the desired values.
    Mismatch { display: StatusObject },
    /// Still unconfirmed after the confirm timeout. State is back to idle;
    /// `display` still carries the desired values for this one frame.
    Abandon { token: String, display: StatusObject },
}

/// Seven random uppercase letters.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| rng.random_range(b'A'..=b'Z') as char)
        .collect()
}

/// Copy of `base` with `fields` written over it.
pub fn overlay(base: &StatusObject, fields: &FieldMap) -> StatusObject {
    let mut out = base.clone();
    for (k, v) in fields {
        out.insert(k.clone(), v.clone());
    }
    out
}

impl Tracker {
    /// Replace whatever is pending with `fields`. Returns the new token.
    pub fn register(&mut self, fields: FieldMap, now: Instant) -> String {
        let token = generate_token();
        *self = Tracker::Pending(PendingCommand {
            fields,
            token: token.clone(),
            issued_at: now,
        });
        token
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        match self {
            Tracker::Pending(cmd) => Some(cmd),
            Tracker::Idle => None,
        }
    }

    /// Compare a fresh status frame against the pending command.
    ///
    /// A full match confirms even past `confirm_timeout`; a mismatch past
    /// it abandons.
    pub fn reconcile(
        &mut self,
        status: &StatusObject,
        now: Instant,
        confirm_timeout: Duration,
    ) -> ReconcileOutcome {
        let Tracker::Pending(cmd) = self else {
            return ReconcileOutcome::Idle;
        };

        let unapplied: Vec<&String> = cmd
            .fields
            .iter()
            .filter(|(k, expected)| {
                status.get(k.as_str()).map(wire_string) != Some(wire_string(expected))
            })
            .map(|(k, _)| k)
            .collect();

        if unapplied.is_empty() {
            let token = std::mem::take(&mut cmd.token);
            *self = Tracker::Idle;
            return ReconcileOutcome::Confirm { token };
        }

        let mut display = status.clone();
        for key in unapplied {
            display.insert(key.clone(), cmd.fields[key.as_str()].clone());
        }

        if now.saturating_duration_since(cmd.issued_at) > confirm_timeout {
            let token = std::mem::take(&mut cmd.token);
            *self = Tracker::Idle;
            return ReconcileOutcome::Abandon { token, display };
        }

        ReconcileOutcome::Mismatch { display }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn map(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn status(v: Value) -> StatusObject {
        let mut obj = map(json!({"FrameType": "SkzpData"}));
        obj.extend(map(v));
        obj
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 7);
        assert!(token.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn test_idle_passes_through() {
        let mut tracker = Tracker::default();
        let outcome = tracker.reconcile(
            &status(json!({"BoilerTempCmd": "6000"})),
            Instant::now(),
            CONFIRM_TIMEOUT,
        );
        assert_eq!(outcome, ReconcileOutcome::Idle);
    }

    #[test]
    fn test_confirm_clears_pending() {
        let now = Instant::now();
        let mut tracker = Tracker::default();
        let token = tracker.register(map(json!({"BoilerTempCmd": "6500"})), now);

        let received = status(json!({"BoilerTempCmd": "6500"}));
        let outcome = tracker.reconcile(&received, now, CONFIRM_TIMEOUT);
        assert_eq!(outcome, ReconcileOutcome::Confirm { token });
        assert!(tracker.pending().is_none());
    }

    #[test]
    fn test_confirm_compares_as_strings() {
        let now = Instant::now();
        let mut tracker = Tracker::default();
        tracker.register(map(json!({"BoilerTempCmd": 6500, "BuModulMax": "2"})), now);

        let outcome = tracker.reconcile(
            &status(json!({"BoilerTempCmd": "6500", "BuModulMax": 2})),
            now,
            CONFIRM_TIMEOUT,
        );
        assert!(matches!(outcome, ReconcileOutcome::Confirm { .. }));
    }

    #[test]
    fn test_mismatch_forces_desired_values() {
        let now = Instant::now();
        let mut tracker = Tracker::default();
        tracker.register(map(json!({"BoilerTempCmd": "6500", "CH1Mode": "Stop"})), now);

        let received = status(json!({"BoilerTempCmd": "6000", "CH1Mode": "Stop", "DHWTempAct": "4410"}));
        let outcome = tracker.reconcile(&received, now + Duration::from_secs(3), CONFIRM_TIMEOUT);
        let ReconcileOutcome::Mismatch { display } = outcome else {
            panic!("expected mismatch, got {outcome:?}");
        };
        assert_eq!(display["BoilerTempCmd"], json!("6500"));
        assert_eq!(display["CH1Mode"], json!("Stop"));
        assert_eq!(display["DHWTempAct"], json!("4410"));
        assert!(tracker.pending().is_some());
    }

    #[test]
    fn test_missing_field_is_a_mismatch() {
        let now = Instant::now();
        let mut tracker = Tracker::default();
        tracker.register(map(json!({"DHWHist": "300"})), now);

        let outcome = tracker.reconcile(&status(json!({})), now, CONFIRM_TIMEOUT);
        let ReconcileOutcome::Mismatch { display } = outcome else {
            panic!("expected mismatch");
        };
        assert_eq!(display["DHWHist"], json!("300"));
    }

    #[test]
    fn test_timeout_abandons() {
        let issued = Instant::now();
        let mut tracker = Tracker::default();
        let token = tracker.register(map(json!({"BoilerTempCmd": "6500"})), issued);

        let outcome = tracker.reconcile(
            &status(json!({"BoilerTempCmd": "6000", "DHWMode": "Stop"})),
            issued + Duration::from_secs(21),
            CONFIRM_TIMEOUT,
        );
        let ReconcileOutcome::Abandon { token: abandoned, display } = outcome else {
            panic!("expected abandon, got {outcome:?}");
        };
        assert_eq!(abandoned, token);
        assert_eq!(display["BoilerTempCmd"], json!("6500"));
        assert_eq!(display["DHWMode"], json!("Stop"));
        assert!(tracker.pending().is_none());
    }

    #[test]
    fn test_late_match_still_confirms() {
        let issued = Instant::now();
        let mut tracker = Tracker::default();
        tracker.register(map(json!({"BoilerTempCmd": "6500"})), issued);

        let outcome = tracker.reconcile(
            &status(json!({"BoilerTempCmd": "6500"})),
            issued + Duration::from_secs(30),
            CONFIRM_TIMEOUT,
        );
        assert!(matches!(outcome, ReconcileOutcome::Confirm { .. }));
    }

    #[test]
    fn test_register_replaces_previous() {
        let now = Instant::now();
        let mut tracker = Tracker::default();
        tracker.register(map(json!({"A": 1})), now);
        let second = tracker.register(map(json!({"B": 2})), now);

        let pending = tracker.pending().unwrap();
        assert_eq!(pending.token, second);
        assert!(!pending.fields.contains_key("A"));
        assert_eq!(pending.fields["B"], json!(2));
    }

    #[test]
    fn test_overlay_substitutes_values() {
        let base = status(json!({"BoilerTempCmd": "6000", "DHWMode": "Stop"}));
        let out = overlay(&base, &map(json!({"DHWMode": "Priority"})));
        assert_eq!(out["DHWMode"], json!("Priority"));
        assert_eq!(out["BoilerTempCmd"], json!("6000"));
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, ["FrameType", "BoilerTempCmd", "DHWMode"]);
    }
}
