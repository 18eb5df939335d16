use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed request with a fixed wire identifier and response type.
///
/// ```
/// use runtimelink_peer::{Request, VoidResponse};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ClassList {
///     image: String,
/// }
///
/// impl Request for ClassList {
///     const IDENTIFIER: &'static str = "com.example.ClassList";
///     type Response = Vec<String>;
/// }
/// ```
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    const IDENTIFIER: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Payload of a message that carries no data. Encodes as `{}`.
///
/// As a handler's response type it means "do not reply".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Null {}

/// An empty but real response. Encodes as `{}` like [`Null`], yet a reply
/// is always sent so the caller learns the request completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidResponse {}

/// Liveness check answered by every built-in server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {}

impl Request for PingRequest {
    const IDENTIFIER: &'static str = "com.runtimelink.Ping";
    type Response = VoidResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_void_share_wire_shape() {
        assert_eq!(serde_json::to_string(&Null {}).unwrap(), "{}");
        assert_eq!(serde_json::to_string(&VoidResponse {}).unwrap(), "{}");
        let _: VoidResponse = serde_json::from_str("{}").unwrap();
    }

    #[test]
    fn ping_identifier() {
        assert_eq!(PingRequest::IDENTIFIER, "com.runtimelink.Ping");
    }
}
