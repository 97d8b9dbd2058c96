//! Wire types for the `POST /` JSON-RPC surface. Intentionally thin: the
//! proxy only needs the envelope (`jsonrpc`, `method`, `params`, `id`) plus
//! enough of the result to decide cacheability; it does not validate method
//! semantics beyond dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Value,
}

/// A request body is either a single object or a batch array; both are
/// accepted and handled by the same single-request pipeline, concurrently
/// for batches.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcRequestEnum {
    Batch(Vec<JsonRpcRequest>),
    Single(JsonRpcRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Success {
        jsonrpc: &'static str,
        result: Value,
        id: Value,
        cached: bool,
    },
    Error {
        jsonrpc: &'static str,
        error: JsonRpcError,
        id: Value,
    },
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value, cached: bool) -> Self {
        Self::Success {
            jsonrpc: JSONRPC_VERSION,
            result,
            id,
            cached,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Error {
            jsonrpc: JSONRPC_VERSION,
            error: JsonRpcError {
                code,
                message: message.into(),
                data,
            },
            id,
        }
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "invalid request", None)
    }

    pub fn internal_error(id: Value, detail: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, "Internal error", Some(Value::String(detail.into())))
    }

    pub fn negative_cache_hit(id: Value, message: String, timestamp: i64) -> Self {
        Self::error(
            id,
            INTERNAL_ERROR,
            message,
            Some(serde_json::json!({ "cached": true, "timestamp": timestamp })),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcResponseEnum {
    Batch(Vec<JsonRpcResponse>),
    Single(JsonRpcResponse),
}
