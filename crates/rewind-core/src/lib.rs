pub mod errors;
pub mod ids;
pub mod json;
pub mod protocol;

pub use errors::{ConfigError, FeatureError, ProtocolError, TransportError};
pub use ids::{ConnectionId, SessionId};
pub use json::{CompactJson, JsonAdapter, JsonFormat, PrettyJson};
