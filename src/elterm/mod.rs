pub mod codec;
pub mod fields;
pub mod server;
pub mod tracker;

use serde_json::{Map, Value};

/// One decoded `SkzpData` frame, keys in wire order.
pub type StatusObject = Map<String, Value>;

/// Field name → desired value, as submitted by a caller.
pub type FieldMap = Map<String, Value>;

/// Render a frame value the way the appliance puts it on the wire.
///
/// Strings are taken verbatim, numbers use their JSON text. Every field
/// comparison and every outgoing command value goes through this.
pub fn wire_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
