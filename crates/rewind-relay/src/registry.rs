//! Connection → session membership.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use dashmap::DashMap;
use rewind_core::{ConnectionId, SessionId};
use serde::Serialize;
use tracing::debug;

/// Which endpoint a connection came in on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    App,
    Inspector,
}

impl Role {
    /// The role messages from this role are forwarded to.
    pub fn peer(self) -> Self {
        match self {
            Self::App => Self::Inspector,
            Self::Inspector => Self::App,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App => f.write_str("app"),
            Self::Inspector => f.write_str("inspector"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Membership {
    role: Role,
    session: SessionId,
}

/// At most one session per connection, plus a `(session, role)` group
/// index kept in step with it for forwarding.
#[derive(Default)]
pub struct SessionRegistry {
    members: DashMap<ConnectionId, Membership>,
    groups: DashMap<(SessionId, Role), HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `connection` in `session`, leaving any session it was in.
    /// Returns the previous session.
    pub fn join(&self, connection: &ConnectionId, role: Role, session: SessionId) -> Option<SessionId> {
        let previous = self.members.insert(
            connection.clone(),
            Membership {
                role,
                session: session.clone(),
            },
        );
        if let Some(prev) = &previous {
            self.ungroup(connection, prev);
            debug!(connection_id = %connection, session_id = %prev.session, "left previous session");
        }
        self.groups
            .entry((session, role))
            .or_default()
            .insert(connection.clone());
        previous.map(|m| m.session)
    }

    pub fn lookup(&self, connection: &ConnectionId) -> Option<SessionId> {
        self.members.get(connection).map(|m| m.session.clone())
    }

    /// Idempotent.
    pub fn leave(&self, connection: &ConnectionId) -> Option<SessionId> {
        let (_, membership) = self.members.remove(connection)?;
        self.ungroup(connection, &membership);
        Some(membership.session)
    }

    fn ungroup(&self, connection: &ConnectionId, membership: &Membership) {
        let key = (membership.session.clone(), membership.role);
        if let Some(mut group) = self.groups.get_mut(&key) {
            group.remove(connection);
        }
        self.groups.remove_if(&key, |_, group| group.is_empty());
    }

    /// Connections of `role` in `session`.
    pub fn members(&self, session: &SessionId, role: Role) -> Vec<ConnectionId> {
        self.groups
            .get(&(session.clone(), role))
            .map(|group| group.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions with at least one member, sorted.
    pub fn sessions(&self) -> Vec<SessionId> {
        let set: BTreeSet<String> = self
            .groups
            .iter()
            .map(|e| e.key().0.as_str().to_string())
            .collect();
        set.into_iter().map(SessionId::from_raw).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
