//! Session-scoped forwarding between application and inspector connections.

use std::sync::Arc;

use rewind_core::protocol::{methods, Frame};
use rewind_core::{ConnectionId, ProtocolError, SessionId};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHub;
use crate::registry::{Role, SessionRegistry};

/// Forwards calls from one side of a session to the other.
///
/// Every operation returns how many peer connections the forward was
/// queued for. Forwarding never waits for the peer.
pub struct RelayBroker {
    registry: SessionRegistry,
    hub: Arc<ConnectionHub>,
}

impl RelayBroker {
    pub fn new(hub: Arc<ConnectionHub>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            hub,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn join(&self, connection: &ConnectionId, role: Role, session_id: &str) -> Result<SessionId, ProtocolError> {
        if session_id.trim().is_empty() {
            return Err(ProtocolError::EmptySessionId);
        }
        let session = SessionId::from_raw(session_id);
        let previous = self.registry.join(connection, role, session.clone());
        info!(
            connection_id = %connection,
            role = %role,
            session_id = %session,
            switched_from = previous.as_ref().map(SessionId::as_str),
            "joined session"
        );
        Ok(session)
    }

    fn session_of(&self, connection: &ConnectionId) -> Result<SessionId, ProtocolError> {
        self.registry.lookup(connection).ok_or(ProtocolError::NoSessionJoined)
    }

    /// Send `method(args)` to every `to` connection in `session`.
    fn forward(&self, session: &SessionId, to: Role, method: &str, args: Vec<Value>) -> usize {
        let text = match Frame::notify(method, args).to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(method, error = %e, "failed to encode forward");
                return 0;
            }
        };
        let mut delivered = 0;
        for member in self.registry.members(session, to) {
            if self.hub.send_to(&member, text.clone()) {
                delivered += 1;
            }
        }
        debug!(session_id = %session, to = %to, method, delivered, "forwarded");
        delivered
    }

    // Application endpoint.

    /// Join `session_id` and announce `config` to the session's inspectors.
    pub fn app_join_session(
        &self,
        connection: &ConnectionId,
        session_id: &str,
        config: Value,
    ) -> Result<usize, ProtocolError> {
        let session = self.join(connection, Role::App, session_id)?;
        Ok(self.forward(&session, Role::Inspector, methods::CONFIGURE, vec![config]))
    }

    pub fn publish_init(&self, connection: &ConnectionId, state_json: Value) -> Result<usize, ProtocolError> {
        let session = self.session_of(connection)?;
        Ok(self.forward(&session, Role::Inspector, methods::INITIALIZE, vec![state_json]))
    }

    pub fn publish_dispatch(
        &self,
        connection: &ConnectionId,
        action_json: Value,
        state_json: Value,
        stack_trace: Value,
    ) -> Result<usize, ProtocolError> {
        let session = self.session_of(connection)?;
        Ok(self.forward(
            &session,
            Role::Inspector,
            methods::DISPATCH,
            vec![action_json, state_json, stack_trace],
        ))
    }

    // Inspector endpoint.

    pub fn inspector_join_session(&self, connection: &ConnectionId, session_id: &str) -> Result<(), ProtocolError> {
        self.join(connection, Role::Inspector, session_id).map(|_| ())
    }

    pub fn request_jump_to_state(&self, connection: &ConnectionId, payload: Value) -> Result<usize, ProtocolError> {
        let session = self.session_of(connection)?;
        Ok(self.forward(&session, Role::App, methods::ON_JUMP_TO_STATE, vec![payload]))
    }

    pub fn request_commit(&self, connection: &ConnectionId) -> Result<usize, ProtocolError> {
        let session = self.session_of(connection)?;
        Ok(self.forward(&session, Role::App, methods::ON_COMMIT, vec![]))
    }

    /// Either endpoint.
    pub fn disconnect(&self, connection: &ConnectionId) {
        if let Some(session) = self.registry.leave(connection) {
            debug!(connection_id = %connection, session_id = %session, "left session on disconnect");
        }
    }
}
