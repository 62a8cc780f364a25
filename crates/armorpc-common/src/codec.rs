use serde_json::Value;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::requests::{RequestId, RpcRequest};
use crate::protocol::responses::FaultBody;

/// JSON codec for the JSON-RPC 1.0 envelope.
///
/// Encoding is plain serde; decoding is deliberately strict. A response must
/// be a JSON object whose `id` equals the outstanding request's id and which
/// carries either a `result` value or an `error` object; anything else is a
/// protocol error, never silently ignored.
///
/// # Example
///
/// ```
/// use armorpc_common::codec::JsonCodec;
/// use armorpc_common::protocol::RpcRequest;
/// use serde_json::json;
///
/// let request = RpcRequest::new(7, "echo", vec![json!("hi")]);
/// let encoded = JsonCodec::encode_request(&request).unwrap();
///
/// let reply = br#"{"id":7,"result":"hi"}"#;
/// let result = JsonCodec::decode_response(reply, 7).unwrap();
/// assert_eq!(result, json!("hi"));
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>> {
        serde_json::to_vec(request)
            .map_err(|e| RpcError::Protocol(format!("unable to encode request: {}", e)))
    }

    /// Decode a response body for the request identified by `expected_id`.
    ///
    /// Returns the `result` value on success and `RpcError::Fault` when the
    /// server reported an application error. A whole-body `null` is tolerated
    /// and decodes to `Value::Null`; some noncompliant servers reply that
    /// way instead of sending a proper envelope.
    pub fn decode_response(data: &[u8], expected_id: RequestId) -> Result<Value> {
        let decoded: Value = serde_json::from_slice(data)
            .map_err(|e| RpcError::Protocol(format!("unable to parse response as JSON: {}", e)))?;

        if decoded.is_null() {
            return Ok(Value::Null);
        }

        let object = decoded.as_object().ok_or_else(|| {
            RpcError::Protocol(format!("response is not a JSON object: {}", snippet(&decoded)))
        })?;

        let id = object.get("id").unwrap_or(&Value::Null);
        if *id != Value::from(expected_id) {
            return Err(RpcError::Protocol(format!(
                "response id {} does not match request id {}",
                id, expected_id
            )));
        }

        if let Some(error) = object.get("error") {
            if !error.is_null() {
                let fault: FaultBody = serde_json::from_value(error.clone())
                    .map_err(|e| RpcError::Protocol(format!("malformed error object: {}", e)))?;
                return Err(RpcError::Fault {
                    code: fault.code,
                    message: fault.message,
                    data: fault.data,
                });
            }
        }

        match object.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(RpcError::Protocol(format!(
                "response carries neither result nor error: {}",
                snippet(&decoded)
            ))),
        }
    }
}

// Keep oversized payloads out of error messages.
fn snippet(value: &Value) -> String {
    let mut s = value.to_string();
    if s.len() > 256 {
        let mut end = 255;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}
