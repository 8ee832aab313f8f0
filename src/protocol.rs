//! Stdio wire protocol (§6): one JSON object per line in, one per line out.
//!
//! No framing beyond the newline — the transport is a pipe, not a socket,
//! and callers are expected to write complete lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single request line: `{id, tool, args}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// A single response line: `{id, ok, result}` or `{id, ok, error}`.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: Value) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Parses one request line. A malformed line is the caller's problem to
/// report; this never panics on bad input.
pub fn parse_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line)
}

pub fn encode_response(response: &Response) -> String {
    serde_json::to_string(response).expect("Response always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_request() {
        let req = parse_request(r#"{"id":1,"tool":"query","args":{"sql":"SELECT 1"}}"#).unwrap();
        assert_eq!(req.tool, "query");
        assert_eq!(req.id, Value::from(1));
    }

    #[test]
    fn request_without_args_defaults_to_null() {
        let req = parse_request(r#"{"id":"a","tool":"health"}"#).unwrap();
        assert_eq!(req.args, Value::Null);
    }

    #[test]
    fn success_response_omits_error_field() {
        let resp = Response::success(Value::from(1), serde_json::json!({"ok": true}));
        let encoded = encode_response(&resp);
        assert!(!encoded.contains("\"error\""));
    }

    #[test]
    fn failure_response_omits_result_field() {
        let resp = Response::failure(Value::from(1), serde_json::json!({"type": "timeout"}));
        let encoded = encode_response(&resp);
        assert!(!encoded.contains("\"result\""));
    }
}
