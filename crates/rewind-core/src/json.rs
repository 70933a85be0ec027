use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Injectable JSON encoding used for every payload that crosses the wire
/// as JSON text (state snapshots, action records, stack traces).
pub trait JsonAdapter: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<String, serde_json::Error>;

    fn deserialize(&self, json: &str) -> Result<Value, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Single-line output. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactJson;

impl JsonAdapter for CompactJson {
    fn serialize(&self, value: &Value) -> Result<String, serde_json::Error> {
        serde_json::to_string(value)
    }
}

/// Indented output, easier to read in inspector panes and logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrettyJson;

impl JsonAdapter for PrettyJson {
    fn serialize(&self, value: &Value) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(value)
    }
}

/// Selects one of the built-in adapters from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFormat {
    #[default]
    Compact,
    Pretty,
}

impl JsonFormat {
    pub fn adapter(self) -> Arc<dyn JsonAdapter> {
        match self {
            Self::Compact => Arc::new(CompactJson),
            Self::Pretty => Arc::new(PrettyJson),
        }
    }
}
