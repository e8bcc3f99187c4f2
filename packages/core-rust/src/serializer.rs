//! Message body serializers.
//!
//! Bodies travel as opaque bytes. The serializer is chosen per envelope by
//! its content type so a receive endpoint can decode bodies produced by any
//! supported format.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Body serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSerializer {
    #[default]
    Json,
    /// `MsgPack` with named fields (`rmp_serde::to_vec_named`).
    MessagePack,
}

impl MessageSerializer {
    /// Selects the serializer matching a content type, ignoring parameters
    /// such as `; charset=utf-8`.
    #[must_use]
    pub fn for_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            JSON_CONTENT_TYPE | "application/vnd.masstransit+json" => Some(Self::Json),
            MSGPACK_CONTENT_TYPE | "application/x-msgpack" | "application/vnd.msgpack" => {
                Some(Self::MessagePack)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => JSON_CONTENT_TYPE,
            Self::MessagePack => MSGPACK_CONTENT_TYPE,
        }
    }

    /// Serializes a message body.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationFailed` naming the Rust type on failure.
    pub fn serialize<T: Serialize>(&self, message: &T) -> Result<Bytes, Error> {
        let encoded = match self {
            Self::Json => serde_json::to_vec(message).map_err(|e| e.to_string()),
            Self::MessagePack => rmp_serde::to_vec_named(message).map_err(|e| e.to_string()),
        };
        encoded
            .map(Bytes::from)
            .map_err(|reason| Error::SerializationFailed {
                type_name: std::any::type_name::<T>().to_string(),
                reason,
            })
    }

    /// Deserializes a message body.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationFailed` naming the Rust type on failure.
    pub fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, Error> {
        let decoded = match self {
            Self::Json => serde_json::from_slice(body).map_err(|e| e.to_string()),
            Self::MessagePack => rmp_serde::from_slice(body).map_err(|e| e.to_string()),
        };
        decoded.map_err(|reason| Error::DeserializationFailed {
            type_name: std::any::type_name::<T>().to_string(),
            reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[test]
    fn both_formats_decode_what_they_encode() {
        let ping = Ping {
            seq: 3,
            note: "hello".into(),
        };
        for serializer in [MessageSerializer::Json, MessageSerializer::MessagePack] {
            let body = serializer.serialize(&ping).unwrap();
            let back: Ping = serializer.deserialize(&body).unwrap();
            assert_eq!(back, ping);
        }
    }

    #[test]
    fn deserialize_failure_names_type() {
        let err = MessageSerializer::Json
            .deserialize::<Ping>(b"{\"seq\":\"x\"}")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationFailed);
        assert!(err.to_string().contains("Ping"));
    }

    #[test]
    fn content_type_lookup_ignores_parameters() {
        assert_eq!(
            MessageSerializer::for_content_type("application/json; charset=utf-8"),
            Some(MessageSerializer::Json)
        );
        assert_eq!(
            MessageSerializer::for_content_type("application/msgpack"),
            Some(MessageSerializer::MessagePack)
        );
        assert_eq!(MessageSerializer::for_content_type("text/plain"), None);
    }
}
