//! Inspector side of a session: receives the app's history and sends
//! time-travel commands back through the relay.

use std::sync::Arc;

use rewind_core::protocol::{arg_as, arg_opt_str, arg_str, methods, JumpToStateCallback, SessionOptions};
use rewind_core::{ProtocolError, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::transport::{handler, Transport};

/// Something the app published to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum InspectorEvent {
    Configure(SessionOptions),
    Initialize {
        state_json: String,
    },
    Dispatch {
        action_json: String,
        state_json: String,
        stack_trace: Option<String>,
    },
}

impl InspectorEvent {
    fn configure(args: &[Value]) -> Result<Self, ProtocolError> {
        Ok(Self::Configure(arg_as(args, 0, methods::CONFIGURE)?))
    }

    fn initialize(args: &[Value]) -> Result<Self, ProtocolError> {
        Ok(Self::Initialize {
            state_json: arg_str(args, 0, methods::INITIALIZE)?.to_string(),
        })
    }

    fn dispatch(args: &[Value]) -> Result<Self, ProtocolError> {
        Ok(Self::Dispatch {
            action_json: arg_str(args, 0, methods::DISPATCH)?.to_string(),
            state_json: arg_str(args, 1, methods::DISPATCH)?.to_string(),
            stack_trace: arg_opt_str(args, 2, methods::DISPATCH)?.map(str::to_string),
        })
    }
}

pub struct InspectorClient {
    transport: Arc<dyn Transport>,
}

impl InspectorClient {
    /// Register the inspector handlers on `transport`. Events arrive on the
    /// returned receiver in the order the relay forwarded them.
    pub fn new(transport: Arc<dyn Transport>) -> (Self, mpsc::UnboundedReceiver<InspectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let parsers: [(&str, fn(&[Value]) -> Result<InspectorEvent, ProtocolError>); 3] = [
            (methods::CONFIGURE, InspectorEvent::configure),
            (methods::INITIALIZE, InspectorEvent::initialize),
            (methods::DISPATCH, InspectorEvent::dispatch),
        ];
        for (method, parse) in parsers {
            let tx = tx.clone();
            transport.on(
                method,
                handler(move |args| {
                    let event = parse(&args);
                    let tx = tx.clone();
                    async move {
                        match event {
                            Ok(event) => {
                                let _ = tx.send(event);
                            }
                            Err(e) => warn!(error = %e, "dropping malformed event"),
                        }
                    }
                }),
            );
        }

        (Self { transport }, rx)
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn join_session(&self, session_id: &str) -> Result<(), TransportError> {
        self.transport
            .invoke(methods::JOIN_SESSION, vec![Value::String(session_id.to_string())])
            .await
    }

    /// Ask the app to show the state recorded after `action_id` actions.
    pub async fn jump_to_state(&self, action_id: u64, state_json: impl Into<String>) -> Result<(), TransportError> {
        let callback = serde_json::to_value(JumpToStateCallback::new(action_id, state_json))?;
        self.transport
            .invoke(methods::ON_JUMP_TO_STATE, vec![callback])
            .await
    }

    pub async fn commit(&self) -> Result<(), TransportError> {
        self.transport.invoke(methods::ON_COMMIT, vec![]).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
