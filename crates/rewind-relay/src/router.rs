//! Maps inbound frames onto broker operations.

use rewind_core::protocol::{arg_str, methods, Frame};
use rewind_core::{ConnectionId, ProtocolError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::RelayBroker;
use crate::registry::Role;

/// Handle one text message from `connection`. Returns the completion to
/// send back, if the caller asked for one.
pub fn route(broker: &RelayBroker, connection: &ConnectionId, role: Role, text: &str) -> Option<Frame> {
    let (id, method, args) = match Frame::parse(text) {
        Ok(Frame::Invoke { id, method, args }) => (id, method, args),
        Ok(Frame::Completion { id, .. }) => {
            debug!(connection_id = %connection, id, "ignoring completion");
            return None;
        }
        Err(e) => {
            warn!(connection_id = %connection, error = %e, "malformed frame");
            return raw_id(text).map(|id| Frame::failed(id, &e));
        }
    };

    let result = match role {
        Role::App => app_call(broker, connection, &method, args),
        Role::Inspector => inspector_call(broker, connection, &method, args),
    };

    match (id, result) {
        (Some(id), Ok(())) => Some(Frame::completed(id)),
        (Some(id), Err(e)) => {
            debug!(connection_id = %connection, method = %method, code = e.code(), "call rejected");
            Some(Frame::failed(id, &e))
        }
        (None, Ok(())) => None,
        (None, Err(e)) => {
            debug!(connection_id = %connection, method = %method, error = %e, "notification rejected");
            None
        }
    }
}

fn app_call(broker: &RelayBroker, connection: &ConnectionId, method: &str, args: Vec<Value>) -> Result<(), ProtocolError> {
    match method {
        methods::JOIN_SESSION => {
            let session = arg_str(&args, 0, method)?.to_string();
            let config = args.get(1).cloned().unwrap_or(Value::Null);
            broker.app_join_session(connection, &session, config)?;
        }
        methods::INITIALIZE => {
            let state = required(args, 0, method)?;
            broker.publish_init(connection, state)?;
        }
        methods::DISPATCH => {
            if args.len() < 2 {
                return Err(ProtocolError::invalid_arguments(method, "expected action and state"));
            }
            let mut args = args.into_iter();
            let action = args.next().unwrap_or(Value::Null);
            let state = args.next().unwrap_or(Value::Null);
            let stack = args.next().unwrap_or(Value::Null);
            broker.publish_dispatch(connection, action, state, stack)?;
        }
        other => return Err(ProtocolError::MethodNotFound(other.to_string())),
    }
    Ok(())
}

fn inspector_call(
    broker: &RelayBroker,
    connection: &ConnectionId,
    method: &str,
    args: Vec<Value>,
) -> Result<(), ProtocolError> {
    match method {
        methods::JOIN_SESSION | methods::NEW_SESSION => {
            let session = arg_str(&args, 0, method)?;
            broker.inspector_join_session(connection, session)?;
        }
        methods::ON_JUMP_TO_STATE => {
            let payload = required(args, 0, method)?;
            broker.request_jump_to_state(connection, payload)?;
        }
        methods::ON_COMMIT => {
            broker.request_commit(connection)?;
        }
        other => return Err(ProtocolError::MethodNotFound(other.to_string())),
    }
    Ok(())
}

fn required(args: Vec<Value>, index: usize, method: &str) -> Result<Value, ProtocolError> {
    args.into_iter()
        .nth(index)
        .ok_or_else(|| ProtocolError::invalid_arguments(method, format!("missing argument {index}")))
}

/// Best-effort id from a frame that failed to parse.
fn raw_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text).ok()?.get("id")?.as_u64()
}
