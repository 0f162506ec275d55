//! Extended JSON values carried inside DDP payloads.
//!
//! ```text
//! date   → {"$date": <milliseconds since epoch>}
//! binary → {"$binary": "<standard base64>"}
//! ```
//!
//! The free functions work on `serde_json::Value`; the [`date`] and
//! [`binary`] submodules plug into `#[serde(with = "...")]` on document types.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

pub const DATE_KEY: &str = "$date";
pub const BINARY_KEY: &str = "$binary";

pub fn encode_date(instant: &DateTime<Utc>) -> Value {
    json!({ DATE_KEY: instant.timestamp_millis() })
}

/// Decode a `{"$date": ms}` object. Anything else yields `None`.
pub fn decode_date(value: &Value) -> Option<DateTime<Utc>> {
    let millis = single_key(value, DATE_KEY)?.as_i64()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub fn encode_binary(bytes: &[u8]) -> Value {
    json!({ BINARY_KEY: STANDARD.encode(bytes) })
}

/// Decode a `{"$binary": base64}` object. Anything else yields `None`.
pub fn decode_binary(value: &Value) -> Option<Vec<u8>> {
    let encoded = single_key(value, BINARY_KEY)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

fn single_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(key),
        _ => None,
    }
}

/// `#[serde(with = "ddp_client::ejson::date")]` for `DateTime<Utc>` fields.
pub mod date {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        super::encode_date(instant).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(d)?;
        super::decode_date(&value).ok_or_else(|| D::Error::custom("expected {\"$date\": millis}"))
    }

    /// Same encoding for `Option<DateTime<Utc>>`; `null` maps to `None`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use serde_json::Value;

        pub fn serialize<S: Serializer>(
            instant: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            instant.as_ref().map(super::super::encode_date).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<Value>::deserialize(d)? {
                None | Some(Value::Null) => Ok(None),
                Some(value) => super::super::decode_date(&value)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom("expected {\"$date\": millis}")),
            }
        }
    }
}

/// `#[serde(with = "ddp_client::ejson::binary")]` for `Vec<u8>` fields.
pub mod binary {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        super::encode_binary(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(d)?;
        super::decode_binary(&value).ok_or_else(|| D::Error::custom("expected {\"$binary\": base64}"))
    }
}
