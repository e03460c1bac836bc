use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Status byte of a message.
///
/// A request is a single `Data` message. A response is zero or more `Data`
/// messages followed by exactly one `End` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FastStatus {
    Data = 0x1,
    End = 0x2,
    Error = 0x3,
}

impl FastStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `true` for `End` and `Error`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, FastStatus::Data)
    }
}

impl TryFrom<u8> for FastStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x1 => Ok(FastStatus::Data),
            0x2 => Ok(FastStatus::End),
            0x3 => Ok(FastStatus::Error),
            other => Err(other),
        }
    }
}

impl fmt::Display for FastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FastStatus::Data => "DATA",
            FastStatus::End => "END",
            FastStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One decoded (or to-be-encoded) protocol message.
///
/// RPC traffic always uses the payload shape `{"m": {"name": METHOD}, "d":
/// ...}` where `d` is an array of items for `Data` and `End`, and an error
/// object for `Error`. The codec only enforces the `d` shape; the helpers
/// below build and inspect the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct FastMessage {
    pub msgid: u32,
    pub status: FastStatus,
    pub data: Value,
}

impl FastMessage {
    pub fn new(msgid: u32, status: FastStatus, data: Value) -> Self {
        Self { msgid, status, data }
    }

    /// Builds the single `Data` message that starts an RPC call.
    pub fn rpc_call(msgid: u32, method: &str, args: Vec<Value>) -> Self {
        Self::rpc_data(msgid, method, args)
    }

    pub fn rpc_data(msgid: u32, method: &str, items: Vec<Value>) -> Self {
        Self::new(msgid, FastStatus::Data, rpc_payload(Some(method), Value::Array(items)))
    }

    pub fn rpc_end(msgid: u32, method: &str) -> Self {
        Self::new(msgid, FastStatus::End, rpc_payload(Some(method), Value::Array(Vec::new())))
    }

    /// Builds an `Error` response. `method` is `None` when the request never
    /// carried a usable method name.
    pub fn rpc_error(msgid: u32, method: Option<&str>, error: &RpcError) -> Self {
        Self::new(msgid, FastStatus::Error, rpc_payload(method, error.to_value()))
    }

    /// The RPC method name at `data.m.name`, if present.
    pub fn method_name(&self) -> Option<&str> {
        self.data.get("m")?.get("name")?.as_str()
    }

    /// The items at `data.d`, if it is an array.
    pub fn items(&self) -> Option<&Vec<Value>> {
        self.data.get("d")?.as_array()
    }

    /// Takes the items out of `data.d`, leaving an empty array behind.
    pub fn take_items(&mut self) -> Vec<Value> {
        match self.data.get_mut("d") {
            Some(Value::Array(items)) => std::mem::take(items),
            _ => Vec::new(),
        }
    }

    /// Parses `data.d` as an error payload.
    pub fn error(&self) -> Option<RpcError> {
        serde_json::from_value(self.data.get("d")?.clone()).ok()
    }
}

fn rpc_payload(method: Option<&str>, d: Value) -> Value {
    json!({ "m": { "name": method }, "d": d })
}

/// Error value carried in the `d` field of an `Error` message.
///
/// `name` and `message` are mandatory on the wire; `info` and `context` are
/// free-form objects. Handlers fail requests with one of these, and the
/// client surfaces the peer's copy inside its server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl RpcError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            info: None,
            context: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// The request was not a well-formed RPC call. `info.rpcMessage` carries
    /// the whole offending message.
    pub fn bad_data(message: &FastMessage) -> Self {
        Self::new("FastError", "RPC request is not well-formed").with_info(json!({
            "fastReason": "bad_data",
            "rpcMsgid": message.msgid,
            "rpcMessage": {
                "msgid": message.msgid,
                "status": message.status.as_u8(),
                "data": message.data,
            },
        }))
    }

    /// The request named a method nobody registered.
    pub fn bad_method(msgid: u32, method: &str) -> Self {
        Self::new("FastError", format!("unsupported RPC method: \"{method}\"")).with_info(json!({
            "fastReason": "bad_method",
            "rpcMethod": method,
            "rpcMsgid": msgid,
        }))
    }

    /// The `fastReason` tag in `info`, for errors produced by the framework.
    pub fn reason(&self) -> Option<&str> {
        self.info.as_ref()?.get("fastReason")?.as_str()
    }

    /// Serializes with `info` and `context` always present, defaulting to
    /// empty objects.
    pub fn to_value(&self) -> Value {
        let empty = || Value::Object(Map::new());
        json!({
            "name": self.name,
            "message": self.message,
            "info": self.info.clone().unwrap_or_else(empty),
            "context": self.context.clone().unwrap_or_else(empty),
        })
    }
}
