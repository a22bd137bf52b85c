// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The message contract every transport applies before sending and after receiving.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use crate::error::ValidationError;

/// A telemetry record: string keys mapped to JSON values.
pub type Message = Map<String, Value>;

/// At least one of these keys must be present for a message to be sent.
const IDENTITY_KEYS: [&str; 4] = ["name", "value", "sensor", "measurement"];

/// Validate an outbound message, returning it with `value` normalised.
///
/// Numeric strings in `value` are coerced to floats; anything else that is
/// not a number or string is rejected.
pub fn validate_data(mut message: Message) -> Result<Message, ValidationError> {
    if !IDENTITY_KEYS.iter().any(|key| message.contains_key(*key)) {
        return Err(ValidationError::MissingIdentity);
    }

    match message.get("timestamp") {
        None => {}
        Some(Value::String(ts)) => {
            if !is_iso8601(ts) {
                return Err(ValidationError::InvalidTimestamp(ts.clone()));
            }
        }
        Some(_) => return Err(ValidationError::TimestampNotString),
    }

    if let Some(value) = message.get_mut("value") {
        match value {
            Value::Number(_) => {}
            Value::String(s) => {
                if let Some(n) = s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                    *value = Value::Number(n);
                }
            }
            _ => return Err(ValidationError::InvalidValue),
        }
    }

    Ok(message)
}

/// Validate and serialise a message into the text sent on the wire.
pub fn encode_message(message: &Message) -> Result<String, ValidationError> {
    let validated = validate_data(message.clone())?;
    Ok(serde_json::to_string(&validated)?)
}

/// Convert an arbitrary JSON value into a [`Message`], rejecting non-objects.
pub fn into_message(value: Value) -> Result<Message, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ValidationError::NotAnObject),
    }
}

/// Decode an inbound payload.
pub fn decode_payload(payload: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Current UTC time as ISO 8601 with microseconds, e.g. `2025-01-01T10:00:00.000000+00:00`.
pub fn generate_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// A short unique identifier such as `iotkit_3f2a9c1b`.
pub fn generate_device_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..8])
}

fn is_iso8601(ts: &str) -> bool {
    DateTime::parse_from_rfc3339(ts).is_ok()
        || DateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f%:z").is_ok()
        || DateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f%:z").is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M").is_ok()
        || NaiveDate::parse_from_str(ts, "%Y-%m-%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(value: Value) -> Message {
        into_message(value).unwrap()
    }

    #[test]
    fn test_requires_identity_key() {
        let err = validate_data(msg(json!({"unit": "C"}))).unwrap_err();
        assert!(matches!(err, ValidationError::MissingIdentity));

        for key in IDENTITY_KEYS {
            let mut m = Message::new();
            m.insert(key.to_string(), json!(1));
            assert!(validate_data(m).is_ok(), "{key} should satisfy the identity check");
        }
    }

    #[test]
    fn test_accepts_iso_timestamps() {
        for ts in [
            "2025-01-01T10:00:00Z",
            "2025-01-01T10:00:00.123456+00:00",
            "2025-01-01T10:00:00",
            "2025-01-01 10:00:00",
            "2025-01-01T10:00",
            "2025-01-01",
        ] {
            let m = msg(json!({"name": "t", "timestamp": ts}));
            assert!(validate_data(m).is_ok(), "{ts} should parse");
        }
    }

    #[test]
    fn test_rejects_bad_timestamps() {
        let err = validate_data(msg(json!({"name": "t", "timestamp": "yesterday"}))).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTimestamp(ts) if ts == "yesterday"));

        let err = validate_data(msg(json!({"name": "t", "timestamp": 1700000000}))).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampNotString));
    }

    #[test]
    fn test_numeric_string_value_is_coerced() {
        let m = validate_data(msg(json!({"value": "21.5"}))).unwrap();
        assert_eq!(m["value"], json!(21.5));

        let m = validate_data(msg(json!({"value": "on"}))).unwrap();
        assert_eq!(m["value"], json!("on"));
    }

    #[test]
    fn test_rejects_structured_value() {
        let err = validate_data(msg(json!({"value": [1, 2]}))).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue));

        let err = validate_data(msg(json!({"value": null}))).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue));
    }

    #[test]
    fn test_encode_validates_first() {
        assert!(encode_message(&msg(json!({"unit": "C"}))).is_err());

        let text = encode_message(&msg(json!({"name": "t", "value": "1"}))).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json!({"name": "t", "value": 1.0}));
    }

    #[test]
    fn test_into_message_rejects_non_objects() {
        assert!(matches!(into_message(json!([1])), Err(ValidationError::NotAnObject)));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(br#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(decode_payload(b"not json").is_err());
    }

    #[test]
    fn test_generated_timestamp_round_trips_through_validation() {
        let ts = generate_timestamp();
        assert!(ts.ends_with("+00:00"));
        assert!(validate_data(msg(json!({"name": "t", "timestamp": ts}))).is_ok());
    }

    #[test]
    fn test_device_id_shape() {
        let id = generate_device_id("sensor");
        assert!(id.starts_with("sensor_"));
        assert_eq!(id.len(), "sensor_".len() + 8);
        assert_ne!(id, generate_device_id("sensor"));
    }
}
