//! Application-side half of rewind: mirrors a state container's history to
//! a remote inspector through the relay and applies the inspector's
//! time-travel commands locally.

pub mod error;
pub mod gate;
pub mod inspector;
pub mod middleware;
pub mod options;
pub mod queue;
pub mod stack;
pub mod store;
pub mod transport;
pub mod ws;

pub use error::ClientError;
pub use gate::{GateState, SequenceGate};
pub use inspector::{InspectorClient, InspectorEvent};
pub use middleware::SyncMiddleware;
pub use options::ClientOptions;
pub use queue::OrderedDispatchQueue;
pub use stack::{StackFilter, StackTraceOptions};
pub use store::{DispatchedAction, Feature, Middleware, StagedState, StateContainer, Store, TypedFeature};
pub use transport::{handler, RemoteHandler, Transport};
pub use ws::WsTransport;
