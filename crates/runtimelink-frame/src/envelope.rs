use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FrameError, Result};

/// One message on the wire: a message-kind identifier and an opaque payload.
///
/// The payload is itself serialized JSON. On the wire it travels base64
/// encoded in the `data` field:
///
/// ```text
/// {"identifier":"echo","data":"ImhlbGxvIg=="}\nOK
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub identifier: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope from raw payload bytes.
    pub fn new(identifier: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(FrameError::EmptyIdentifier);
        }
        Ok(Self {
            identifier,
            payload: payload.into(),
        })
    }

    /// Create an envelope whose payload is `value` serialized as JSON.
    pub fn from_value<T: Serialize + ?Sized>(identifier: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Self::new(identifier, payload)
    }

    /// Deserialize the payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// The in-band error shape, sent in place of a reply when the answering
/// side failed. Only an object with exactly a `message` string matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(deny_unknown_fields)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A decoded, terminator-delimited chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Envelope(Envelope),
    Error(RemoteError),
}

impl Inbound {
    /// Parse one chunk (without its terminator).
    ///
    /// An envelope is tried first; a chunk that is not an envelope but has
    /// the `{message}` shape is a relayed error.
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        let envelope_err = match serde_json::from_slice::<Envelope>(chunk) {
            Ok(envelope) if envelope.identifier.is_empty() => {
                return Err(FrameError::EmptyIdentifier)
            }
            Ok(envelope) => return Ok(Inbound::Envelope(envelope)),
            Err(err) => err,
        };
        match serde_json::from_slice::<RemoteError>(chunk) {
            Ok(error) => Ok(Inbound::Error(error)),
            Err(_) => Err(FrameError::Malformed {
                reason: envelope_err.to_string(),
            }),
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_base64_in_data_field() {
        let envelope = Envelope::from_value("echo", "hello").unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"identifier":"echo","data":"ImhlbGxvIg=="}"#);
    }

    #[test]
    fn decode_payload_as_typed_value() {
        let envelope = Envelope::from_value("sum", &[1, 2, 3]).unwrap();
        let values: Vec<u32> = envelope.decode_payload().unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        let wrong: Result<String> = envelope.decode_payload();
        assert!(matches!(wrong, Err(FrameError::Json(_))));
    }

    #[test]
    fn empty_identifier_rejected() {
        assert!(matches!(
            Envelope::new("", Bytes::new()),
            Err(FrameError::EmptyIdentifier)
        ));
        assert!(matches!(
            Inbound::parse(br#"{"identifier":"","data":""}"#),
            Err(FrameError::EmptyIdentifier)
        ));
    }

    #[test]
    fn parse_distinguishes_error_shape() {
        let inbound = Inbound::parse(br#"{"message":"boom"}"#).unwrap();
        assert_eq!(inbound, Inbound::Error(RemoteError::new("boom")));

        let inbound = Inbound::parse(br#"{"identifier":"x","data":"e30="}"#).unwrap();
        match inbound {
            Inbound::Envelope(envelope) => assert_eq!(envelope.payload.as_ref(), b"{}"),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn error_shape_has_only_a_message() {
        assert!(serde_json::from_slice::<RemoteError>(br#"{"message":"boom","code":3}"#).is_err());
        assert!(serde_json::from_slice::<RemoteError>(br#"{"message":7}"#).is_err());
        assert!(matches!(
            Inbound::parse(br#"{"message":"boom","code":3}"#),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Inbound::parse(b"not json"),
            Err(FrameError::Malformed { .. })
        ));
        assert!(matches!(
            Inbound::parse(br#"{"identifier":"x","data":"%%%"}"#),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn remote_error_displays_message() {
        assert_eq!(RemoteError::new("no such class").to_string(), "no such class");
    }
}
