//! The JSON-RPC envelope used on `POST /rpc`.
//!
//! Requests name a method (`LLM.send_message`, `TASK.create_task`, …) and
//! carry positional `args` and/or named `kwargs`. Responses are either
//! `{ok: true, data}` or `{ok: false, error}` with a stable error code.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl RpcRequest {
    /// Look up a named argument, falling back to a positional index.
    pub fn arg(&self, name: &str, pos: usize) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(pos))
    }

    /// Required string argument.
    pub fn str_arg(&self, name: &str, pos: usize) -> crate::Result<String> {
        self.arg(name, pos)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| crate::Error::InvalidArgs(format!("missing argument '{name}'")))
    }

    /// Optional string argument.
    pub fn opt_str_arg(&self, name: &str, pos: usize) -> Option<String> {
        self.arg(name, pos)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MethodNotFound,
    InvalidArgs,
    Internal,
    ThreadBusy,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                retry_after_ms: None,
            }),
        }
    }

    pub fn retry_after(mut self, ms: u64) -> Self {
        if let Some(e) = &mut self.error {
            e.retry_after_ms = Some(ms);
        }
        self
    }
}

impl From<&crate::Error> for ErrorCode {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::MethodNotFound(_) => ErrorCode::MethodNotFound,
            crate::Error::InvalidArgs(_) => ErrorCode::InvalidArgs,
            crate::Error::ThreadBusy(_) => ErrorCode::ThreadBusy,
            crate::Error::RateLimited(_) => ErrorCode::RateLimited,
            crate::Error::NotFound(_) => ErrorCode::InvalidArgs,
            _ => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwargs_take_precedence_over_args() {
        let req: RpcRequest = serde_json::from_str(
            r#"{"method":"LLM.send_message","args":["positional"],"kwargs":{"user":"named"}}"#,
        )
        .unwrap();
        assert_eq!(req.str_arg("user", 0).unwrap(), "named");
    }

    #[test]
    fn positional_fallback() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"method":"m","args":["u1","c1"]}"#).unwrap();
        assert_eq!(req.str_arg("user", 0).unwrap(), "u1");
        assert_eq!(req.str_arg("company", 1).unwrap(), "c1");
    }

    #[test]
    fn missing_arg_is_invalid_args() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"m"}"#).unwrap();
        let err = req.str_arg("user", 0).unwrap_err();
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidArgs);
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let resp = RpcResponse::err(ErrorCode::MethodNotFound, "no such method");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "METHOD_NOT_FOUND");
    }

    #[test]
    fn retry_after_round_trips() {
        let resp = RpcResponse::err(ErrorCode::RateLimited, "slow down").retry_after(1500);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["retry_after_ms"], 1500);
    }
}
