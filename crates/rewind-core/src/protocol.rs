//! Wire protocol shared by the client transport and the relay.
//!
//! Every WebSocket text message is one [`Frame`]. An `invoke` frame with an
//! `id` expects a `completion` frame carrying the same id; an `invoke`
//! without an id is fire-and-forget (used by the relay when forwarding).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// Remote method names.
pub mod methods {
    /// App → relay and inspector → relay.
    pub const JOIN_SESSION: &str = "JoinSession";
    /// Older inspector builds call this instead of `JoinSession`.
    pub const NEW_SESSION: &str = "NewSession";
    /// App → relay, relay → inspector.
    pub const INITIALIZE: &str = "Initialize";
    /// App → relay, relay → inspector.
    pub const DISPATCH: &str = "Dispatch";
    /// Relay → inspector, carries the app's [`SessionOptions`](super::SessionOptions).
    pub const CONFIGURE: &str = "Configure";
    /// Inspector → relay, relay → app.
    pub const ON_JUMP_TO_STATE: &str = "OnJumpToState";
    /// Inspector → relay, relay → app.
    pub const ON_COMMIT: &str = "OnCommit";
}

/// One transport message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Invoke {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Completion {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

/// Error object carried by a failed completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl Frame {
    pub fn invoke(id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Invoke {
            id: Some(id),
            method: method.into(),
            args,
        }
    }

    pub fn notify(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Invoke {
            id: None,
            method: method.into(),
            args,
        }
    }

    pub fn completed(id: u64) -> Self {
        Self::Completion {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: u64, err: &ProtocolError) -> Self {
        Self::Completion {
            id,
            success: false,
            error: Some(RemoteError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Display and history settings the app announces when joining a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub name: String,
    /// Update latency hint in milliseconds.
    pub latency: u64,
    pub max_history: u16,
    pub stack_trace_enabled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "rewind".into(),
            latency: 50,
            max_history: 50,
            stack_trace_enabled: false,
        }
    }
}

/// Action as the inspector sees it: `{"type": ..., "payload": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpToStatePayload {
    #[serde(rename = "actionId")]
    pub action_id: u64,
}

/// Sent by the inspector to rewind the app to a recorded state.
///
/// `state` is the snapshot as JSON text, keyed by feature name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpToStateCallback {
    pub payload: JumpToStatePayload,
    pub state: String,
}

impl JumpToStateCallback {
    pub fn new(action_id: u64, state: impl Into<String>) -> Self {
        Self {
            payload: JumpToStatePayload { action_id },
            state: state.into(),
        }
    }
}

/// Required string argument at `index`.
pub fn arg_str<'a>(args: &'a [Value], index: usize, method: &str) -> Result<&'a str, ProtocolError> {
    args.get(index)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::invalid_arguments(method, format!("argument {index} must be a string")))
}

/// Optional string argument; missing and `null` both read as `None`.
pub fn arg_opt_str<'a>(args: &'a [Value], index: usize, method: &str) -> Result<Option<&'a str>, ProtocolError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ProtocolError::invalid_arguments(
            method,
            format!("argument {index} must be a string or null"),
        )),
    }
}

/// Typed argument at `index`.
pub fn arg_as<T: DeserializeOwned>(args: &[Value], index: usize, method: &str) -> Result<T, ProtocolError> {
    let value = args
        .get(index)
        .ok_or_else(|| ProtocolError::invalid_arguments(method, format!("missing argument {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::invalid_arguments(method, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invoke_frame_wire_shape() {
        let frame = Frame::invoke(7, methods::INITIALIZE, vec![json!("{}")]);
        let v: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v, json!({"type": "invoke", "id": 7, "method": "Initialize", "args": ["{}"]}));
    }

    #[test]
    fn notify_frame_omits_id() {
        let text = Frame::notify(methods::ON_COMMIT, vec![]).to_text().unwrap();
        assert!(!text.contains("\"id\""));
        assert!(text.contains("\"method\":\"OnCommit\""));
    }

    #[test]
    fn parse_invoke_without_args() {
        let frame = Frame::parse(r#"{"type":"invoke","method":"OnCommit"}"#).unwrap();
        assert_eq!(frame, Frame::notify("OnCommit", vec![]));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = Frame::parse("not json").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
        assert!(Frame::parse(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn failed_completion_carries_code() {
        let frame = Frame::failed(3, &ProtocolError::NoSessionJoined);
        let v: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "NO_SESSION");
        assert_eq!(v["id"], 3);

        let ok = serde_json::to_value(Frame::completed(4)).unwrap();
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn session_options_camel_case() {
        let v = serde_json::to_value(SessionOptions::default()).unwrap();
        assert_eq!(
            v,
            json!({"name": "rewind", "latency": 50, "maxHistory": 50, "stackTraceEnabled": false})
        );
    }

    #[test]
    fn action_info_uses_type_key() {
        let info = ActionInfo {
            action_type: "Inc".into(),
            payload: json!({}),
        };
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"type": "Inc", "payload": {}}));
    }

    #[test]
    fn jump_callback_wire_shape() {
        let cb: JumpToStateCallback = serde_json::from_value(json!({
            "type": "DISPATCH",
            "payload": {"type": "JUMP_TO_ACTION", "actionId": 0},
            "state": "{\"counter\":{\"count\":0}}"
        }))
        .unwrap();
        assert_eq!(cb, JumpToStateCallback::new(0, r#"{"counter":{"count":0}}"#));
    }

    #[test]
    fn argument_helpers() {
        let args = vec![json!("abc"), Value::Null, json!(5), json!({"actionId": 2})];
        assert_eq!(arg_str(&args, 0, "M").unwrap(), "abc");
        assert!(arg_str(&args, 2, "M").is_err());
        assert!(arg_str(&args, 9, "M").is_err());
        assert_eq!(arg_opt_str(&args, 1, "M").unwrap(), None);
        assert_eq!(arg_opt_str(&args, 9, "M").unwrap(), None);
        assert!(arg_opt_str(&args, 2, "M").is_err());
        let p: JumpToStatePayload = arg_as(&args, 3, "M").unwrap();
        assert_eq!(p.action_id, 2);
        let err = arg_as::<JumpToStatePayload>(&args, 0, "M").unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
    }
}
