//! JSON-RPC envelope and handshake requests.
//!
//! The agent talks to the pool with line-delimited JSON-RPC. Handshake
//! requests carry short string identifiers (`"sub"`, `"conf"`, `"caps"`,
//! `"auth"`) so responses can be routed without a pending-request table.
//! Payloads stay as [`serde_json::Value`]; each handler checks the shape it
//! expects instead of relying on serde coercion.

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Value, json};

/// Request identifier for `mining.subscribe`.
pub const SUBSCRIBE_ID: &str = "sub";

/// Request identifier for `mining.configure`.
pub const CONFIGURE_ID: &str = "conf";

/// Request identifier for `agent.get_capabilities`.
pub const CAPABILITIES_ID: &str = "caps";

/// Request identifier for `mining.authorize`.
pub const AUTHORIZE_ID: &str = "auth";

/// Version-rolling mask advertised in `mining.configure` (all 32 bits).
pub const FULL_VERSION_MASK: &str = "ffffffff";

/// Capability string for version rolling (ASICBoost).
pub const CAP_VERSION_ROLLING: &str = "verrol";

/// Capability string for share responses sent back by the server.
pub const CAP_SUBMIT_RESPONSE: &str = "subres";

/// JSON-RPC message envelope.
///
/// Pools are loose about identifiers: they may be strings, numbers or
/// `null`, so the id is kept as a raw value. A message with a `method` is a
/// request or notification; anything else is treated as a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message ID (null for notifications)
        id: Option<Value>,
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        #[serde(deserialize_with = "non_empty_method")]
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: Option<Value>,
        /// Result value (absent or null on failure)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (absent or null on success)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a request with a string identifier.
    pub fn request(id: &str, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(Value::String(id.to_string())),
            method: method.into(),
            params,
        }
    }

    /// Decode one line received from the pool.
    pub fn from_line(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }

    /// Serialize to a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Get the identifier if it is a string.
    pub fn id(&self) -> Option<&str> {
        let id = match self {
            JsonRpcMessage::Request { id, .. } | JsonRpcMessage::Response { id, .. } => id,
        };
        id.as_ref().and_then(Value::as_str)
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// An empty `method` does not make a request: such a line falls through to
/// [`JsonRpcMessage::Response`] and is routed by id.
fn non_empty_method<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let method = String::deserialize(deserializer)?;
    if method.is_empty() {
        return Err(de::Error::custom("empty method"));
    }
    Ok(method)
}

/// `mining.subscribe` with the agent's identity string.
pub fn subscribe_request(user_agent: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(SUBSCRIBE_ID, "mining.subscribe", json!([user_agent]))
}

/// `mining.configure` asking for version rolling over the full mask.
pub fn configure_request() -> JsonRpcMessage {
    JsonRpcMessage::request(
        CONFIGURE_ID,
        "mining.configure",
        json!([
            ["version-rolling"],
            {
                "version-rolling.mask": FULL_VERSION_MASK,
                "version-rolling.min-bit-count": 0
            }
        ]),
    )
}

/// `agent.get_capabilities` asking about version rolling.
pub fn capabilities_request() -> JsonRpcMessage {
    JsonRpcMessage::request(
        CAPABILITIES_ID,
        "agent.get_capabilities",
        json!([[CAP_VERSION_ROLLING]]),
    )
}

/// `mining.authorize` for a sub-account with an empty password.
pub fn authorize_request(sub_account: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(AUTHORIZE_ID, "mining.authorize", json!([sub_account, ""]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_with_string_id() {
        let msg =
            JsonRpcMessage::from_line(br#"{"id":"auth","result":true,"error":null}"#).unwrap();

        assert_eq!(msg.id(), Some("auth"));
        assert_eq!(msg.method(), None);
        match msg {
            JsonRpcMessage::Response { result, error, .. } => {
                assert_eq!(result, Some(json!(true)));
                assert_eq!(error, None);
            }
            _ => panic!("Expected Response variant"),
        }
    }

    #[test]
    fn parse_notification_with_null_id() {
        let msg = JsonRpcMessage::from_line(
            br#"{"id":null,"method":"mining.set_difficulty","params":[8192]}"#,
        )
        .unwrap();

        assert_eq!(msg.id(), None);
        assert_eq!(msg.method(), Some("mining.set_difficulty"));
    }

    #[test]
    fn numeric_id_is_not_a_handshake_id() {
        let msg = JsonRpcMessage::from_line(br#"{"id":7,"result":true}"#).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Response { .. }));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn empty_method_is_a_response() {
        let msg = JsonRpcMessage::from_line(
            br#"{"id":"sub","method":"","result":[[],"0a0b0c0d",8],"error":null}"#,
        )
        .unwrap();

        assert_eq!(msg.method(), None);
        assert_eq!(msg.id(), Some("sub"));
        match msg {
            JsonRpcMessage::Response { result, .. } => {
                assert_eq!(result, Some(json!([[], "0a0b0c0d", 8])));
            }
            _ => panic!("Expected Response variant"),
        }
    }

    #[test]
    fn garbage_line_fails_to_decode() {
        assert!(JsonRpcMessage::from_line(b"{\"id\":\"sub\",").is_err());
        assert!(JsonRpcMessage::from_line(b"not json\n").is_err());
    }

    #[test]
    fn configure_request_wire_format() {
        let line = configure_request().to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let value: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "conf",
                "method": "mining.configure",
                "params": [
                    ["version-rolling"],
                    {"version-rolling.mask": "ffffffff", "version-rolling.min-bit-count": 0}
                ]
            })
        );
    }

    #[test]
    fn authorize_request_sends_empty_password() {
        let value = serde_json::to_value(authorize_request("acct.worker")).unwrap();
        assert_eq!(value["id"], "auth");
        assert_eq!(value["method"], "mining.authorize");
        assert_eq!(value["params"], json!(["acct.worker", ""]));
    }

    #[test]
    fn capabilities_request_asks_for_verrol() {
        let value = serde_json::to_value(capabilities_request()).unwrap();
        assert_eq!(value["method"], "agent.get_capabilities");
        assert_eq!(value["params"], json!([["verrol"]]));
    }
}
