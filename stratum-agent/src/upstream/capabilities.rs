//! Server capability negotiation.
//!
//! `agent.get_capabilities` tells the agent which proxy extensions the pool
//! understands. The answer is advisory: a pool that answers badly, or not
//! at all, simply gets no optional features.

use serde_json::Value;

use super::messages::{CAP_SUBMIT_RESPONSE, CAP_VERSION_ROLLING};

/// Optional features the pool server supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Pool accepts version-rolled shares (ASICBoost)
    pub version_rolling: bool,
    /// Pool sends submit responses back through the agent
    pub submit_response: bool,
}

impl ServerCapabilities {
    /// Interpret an `agent.get_capabilities` result.
    ///
    /// Never fails. Shape problems come back as messages for the caller to
    /// log; whatever could be read is still applied. Unknown capability
    /// strings are ignored.
    pub fn from_result(result: Option<&Value>) -> (Self, Vec<String>) {
        let mut caps = Self::default();
        let mut problems = Vec::new();

        let Some(obj) = result.and_then(Value::as_object) else {
            problems.push("result is not an object".to_string());
            return (caps, problems);
        };

        let Some(list) = obj.get("capabilities") else {
            problems.push("missing field capabilities".to_string());
            return (caps, problems);
        };

        let Some(list) = list.as_array() else {
            problems.push("capabilities is not an array".to_string());
            return (caps, problems);
        };

        for capability in list {
            match capability.as_str() {
                Some(CAP_VERSION_ROLLING) => caps.version_rolling = true,
                Some(CAP_SUBMIT_RESPONSE) => caps.submit_response = true,
                _ => {}
            }
        }

        (caps, problems)
    }
}

/// Parameters agreed with the pool through `mining.configure`.
///
/// The configure response is not interpreted yet, so these stay at the
/// values the agent asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    /// Version bits the pool allows rolling
    pub version_rolling_mask: u32,
    /// Minimum number of rollable bits requested
    pub version_rolling_min_bit_count: u32,
}

impl Default for NegotiatedParams {
    fn default() -> Self {
        Self {
            version_rolling_mask: u32::MAX,
            version_rolling_min_bit_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn both_capabilities() {
        let result = json!({"capabilities": ["verrol", "subres"]});
        let (caps, problems) = ServerCapabilities::from_result(Some(&result));

        assert!(caps.version_rolling);
        assert!(caps.submit_response);
        assert!(problems.is_empty());
    }

    #[test]
    fn empty_list_means_no_features() {
        let result = json!({"capabilities": []});
        let (caps, problems) = ServerCapabilities::from_result(Some(&result));

        assert_eq!(caps, ServerCapabilities::default());
        assert!(problems.is_empty());
    }

    #[test]
    fn unknown_capabilities_are_ignored() {
        let result = json!({"capabilities": ["future-thing", 42, "verrol"]});
        let (caps, problems) = ServerCapabilities::from_result(Some(&result));

        assert!(caps.version_rolling);
        assert!(!caps.submit_response);
        assert!(problems.is_empty());
    }

    #[test]
    fn malformed_shapes_are_reported() {
        let cases = [
            None,
            Some(json!(["verrol"])),
            Some(json!({"caps": ["verrol"]})),
            Some(json!({"capabilities": "verrol"})),
        ];

        for result in &cases {
            let (caps, problems) = ServerCapabilities::from_result(result.as_ref());
            assert_eq!(caps, ServerCapabilities::default(), "case {:?}", result);
            assert_eq!(problems.len(), 1, "case {:?}", result);
        }
    }

    #[test]
    fn negotiated_defaults_match_request() {
        let params = NegotiatedParams::default();
        assert_eq!(params.version_rolling_mask, 0xffff_ffff);
        assert_eq!(params.version_rolling_min_bit_count, 0);
    }
}
