//! Response wire types.
//!
//! The client decodes responses through [`crate::codec::JsonCodec`], which
//! works on the raw JSON so it can distinguish an absent `result` key from a
//! `null` result. These structs exist for the other direction: building
//! well-formed reply bodies (test servers, fixtures).

use serde::{Deserialize, Serialize};
use super::RequestId;

pub type RpcResult = serde_json::Value;

/// Server-reported application error payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: Option<RpcResult>,
    pub error: Option<FaultBody>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        RpcResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn fault(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        RpcResponse {
            id,
            result: None,
            error: Some(FaultBody {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}
