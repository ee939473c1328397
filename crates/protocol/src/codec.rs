//! Conversion between protocol values and newline-terminated JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::message::{Command, Message};

/// Why a single line could not be turned into a message. Never fatal for
/// the connection: callers log it and move on to the next line.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
}

/// Decode one line received on the telemetry connection.
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    decode_kind(line, Message::KINDS)
}

/// Decode one line received on the command connection (controller side).
pub fn decode_command(line: &str) -> Result<Command, DecodeError> {
    decode_kind(line, Command::KINDS)
}

/// Serialize a message and append the `\n` delimiter.
///
/// Only fails for values serde_json cannot represent, which none of the
/// protocol types produce.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    Ok(buf)
}

fn decode_kind<T: DeserializeOwned>(line: &str, known: &[&str]) -> Result<T, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(DecodeError::Syntax)?;

    let kind = match &value {
        Value::Object(obj) => match obj.get("CMD") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => {
                return Err(DecodeError::Schema(format!(
                    "CMD must be a string, got {other}"
                )))
            }
            None => return Err(DecodeError::Schema("missing CMD field".to_string())),
        },
        _ => return Err(DecodeError::Schema("expected a JSON object".to_string())),
    };

    if !known.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Schema(format!("{kind}: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================
