//! Relay pairing application instances with inspectors by session id.
//!
//! Two WebSocket endpoints share one [`SessionRegistry`]: `/app` for
//! applications and `/inspector` for inspectors. Calls arriving on one side
//! are forwarded to the other side's connections in the same session.

pub mod broker;
pub mod config;
pub mod connection;
pub mod registry;
pub mod router;
pub mod server;

pub use broker::RelayBroker;
pub use config::ServerConfig;
pub use connection::ConnectionHub;
pub use registry::{Role, SessionRegistry};
pub use server::{start, ServerHandle};
