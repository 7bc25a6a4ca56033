use std::fmt;
use std::io;

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;

use super::tracker::PendingCommand;
use super::{StatusObject, wire_string};

/// Discriminator of appliance status frames.
pub const STATUS_FRAME_TYPE: &str = "SkzpData";
/// Discriminator of server → appliance command frames.
pub const COMMAND_FRAME_TYPE: &str = "DataToSend";
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

const MASKED_KEYS: [&str; 2] = ["vId", "vPin"];

#[derive(Debug)]
pub enum DecodeError {
    /// The line is not valid JSON.
    Json(serde_json::Error),
    /// Valid JSON, but the top level is not an object.
    NotAnObject,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "invalid JSON: {e}"),
            DecodeError::NotAnObject => write!(f, "frame is not a JSON object"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Json(e) => Some(e),
            DecodeError::NotAnObject => None,
        }
    }
}

/// Decode one received line.
///
/// Returns `Ok(None)` for well-formed frames of any type other than
/// `SkzpData`. Invalid UTF-8 is replaced rather than rejected; the JSON
/// parse decides whether the line is usable.
pub fn decode(line: &[u8]) -> Result<Option<StatusObject>, DecodeError> {
    let text = String::from_utf8_lossy(line);
    let value: Value =
        serde_json::from_str(text.trim_end_matches(['\r', '\n'])).map_err(DecodeError::Json)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    match obj.get("FrameType").and_then(Value::as_str) {
        Some(STATUS_FRAME_TYPE) => Ok(Some(obj)),
        _ => Ok(None),
    }
}

/// Wire form of a pending command. Built fresh for every transmission.
#[derive(Debug, Serialize)]
pub struct CommandFrame<'a> {
    #[serde(rename = "FrameType")]
    frame_type: &'static str,
    #[serde(rename = "vId")]
    device_id: &'a str,
    #[serde(rename = "vPin")]
    device_pin: &'a str,
    #[serde(flatten)]
    fields: serde_json::Map<String, Value>,
    #[serde(rename = "vToken")]
    token: &'a str,
}

impl<'a> CommandFrame<'a> {
    pub fn new(device_id: &'a str, device_pin: &'a str, pending: &'a PendingCommand) -> Self {
        let fields = pending
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(wire_string(v))))
            .collect();
        Self {
            frame_type: COMMAND_FRAME_TYPE,
            device_id,
            device_pin,
            fields,
            token: &pending.token,
        }
    }

    /// JSON rendering safe for logs: credentials replaced by `***`.
    pub fn masked(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(obj) = &mut value {
            for key in MASKED_KEYS {
                if let Some(v) = obj.get_mut(key) {
                    *v = Value::String("***".into());
                }
            }
        }
        value
    }
}

/// Compact JSON that escapes everything outside ASCII as `\uXXXX`.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Encode a command frame as one CRLF-terminated line.
pub fn encode(frame: &CommandFrame<'_>) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    frame.serialize(&mut ser)?;
    out.extend_from_slice(LINE_TERMINATOR);
    Ok(out)
}
