use rewind_core::{ConfigError, FeatureError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot must be a JSON object keyed by feature name")]
    InvalidSnapshot,

    #[error("middleware used before initialize")]
    NotInitialized,

    #[error("middleware already initialized")]
    AlreadyInitialized,
}
