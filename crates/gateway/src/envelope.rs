//! JSON-RPC envelope helpers
//!
//! The gateway treats request and response bodies as raw [`serde_json::Value`]
//! trees end to end; this module collects the small amount of envelope
//! structure the gateway actually needs to inspect.

use serde_json::{json, Value};

/// The only protocol version the gateway speaks
pub const JSONRPC_VERSION: &str = "2.0";

/// Checks whether a body is a structurally valid JSON-RPC request envelope
///
/// A valid envelope is an object with `jsonrpc: "2.0"`, a non-empty string
/// `method`, an `id` that is absent, null, a string or a number, and
/// `params` that are absent, an array or an object.
pub fn is_valid_envelope(body: &Value) -> bool {
    let Some(obj) = body.as_object() else {
        return false;
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return false;
    }

    match obj.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => {}
        _ => return false,
    }

    if let Some(id) = obj.get("id") {
        if !(id.is_null() || id.is_string() || id.is_number()) {
            return false;
        }
    }

    if let Some(params) = obj.get("params") {
        if !(params.is_array() || params.is_object()) {
            return false;
        }
    }

    true
}

/// Extracts the request id, defaulting to null for malformed bodies
pub fn request_id(body: &Value) -> Value {
    body.get("id").cloned().unwrap_or(Value::Null)
}

/// Extracts the method name of a request body
pub fn method_name(body: &Value) -> Option<&str> {
    body.get("method").and_then(Value::as_str)
}

/// Builds a success response envelope
pub fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Builds an error response envelope
pub fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
}

/// The fixed response for payloads that are not parseable JSON
///
/// Per the JSON-RPC spec the id of a parse error response is null, since
/// the request id could not be read.
pub fn parse_error() -> Value {
    error_envelope(Value::Null, -32700, "invalid json request")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_envelope_accepted() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []});
        assert!(is_valid_envelope(&body));
    }

    #[test]
    fn test_missing_method_rejected() {
        let body = json!({"jsonrpc": "2.0", "id": 1});
        assert!(!is_valid_envelope(&body));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let body = json!({"jsonrpc": "1.0", "id": 1, "method": "eth_blockNumber"});
        assert!(!is_valid_envelope(&body));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(!is_valid_envelope(&json!("eth_blockNumber")));
        assert!(!is_valid_envelope(&json!(42)));
    }

    #[test]
    fn test_bad_id_type_rejected() {
        let body = json!({"jsonrpc": "2.0", "id": {"nested": true}, "method": "m"});
        assert!(!is_valid_envelope(&body));
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let env = parse_error();
        assert!(env["id"].is_null());
        assert_eq!(env["error"]["code"], -32700);
    }
}
