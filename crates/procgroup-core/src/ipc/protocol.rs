//! JSON-RPC 2.0 messages of the control channel and their framing.
//!
//! Frames use the transport's length prefix with the smaller
//! [`ControlConfig::MAX_MESSAGE_SIZE`] limit:
//!
//! ```text
//! [u32 BE length][UTF-8 JSON]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ControlConfig;
use crate::error::{ProcessError, Result};
use crate::transport::envelope;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code of a frame that is not a JSON-RPC request.
pub const PARSE_ERROR: i32 = -32700;
/// Error code of a request with the wrong protocol version.
pub const INVALID_REQUEST: i32 = -32600;

/// A method call sent to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl IpcRequest {
    pub fn call(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::from(id)),
        }
    }

    /// Take the params, treating a missing value as `{}`.
    pub fn take_params(&mut self) -> Value {
        self.params
            .take()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

/// Either half of a response body. Serialized as a `result` or an `error`
/// member next to `jsonrpc` and `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(IpcError),
}

/// The controller's answer to one [`IpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub id: Option<Value>,
}

impl IpcResponse {
    pub fn ok(id: Option<Value>, value: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: Outcome::Result(value),
            id,
        }
    }

    pub fn failed(id: Option<Value>, error: IpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: Outcome::Error(error),
            id,
        }
    }

    /// The result value, or the error as [`ProcessError::Rpc`].
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(ProcessError::Rpc {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&ProcessError> for IpcError {
    fn from(err: &ProcessError) -> Self {
        Self::new(err.to_rpc_error_code(), err.to_string())
    }
}

/// Read one control frame. `None` means the peer closed the connection.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    envelope::read_frame(reader, ControlConfig::MAX_MESSAGE_SIZE).await
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    envelope::write_frame(writer, payload).await
}
