use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use rewind_core::protocol::SessionOptions;
use rewind_core::{ConfigError, JsonAdapter, JsonFormat, SessionId};

use crate::stack::{StackFilter, StackTraceOptions};

pub const ENV_ENDPOINT: &str = "REWIND_ENDPOINT";
pub const ENV_SESSION_ID: &str = "REWIND_SESSION_ID";
pub const ENV_NAME: &str = "REWIND_NAME";

/// Settings for [`SyncMiddleware`](crate::SyncMiddleware).
#[derive(Clone)]
pub struct ClientOptions {
    /// WebSocket URI of the relay's application endpoint, e.g. `ws://host:9092/app`.
    pub endpoint: Option<String>,
    pub session_id: Option<SessionId>,
    /// Name shown in the inspector.
    pub name: String,
    pub latency: Duration,
    /// How many actions the inspector keeps.
    pub max_history: u16,
    pub stack_trace: StackTraceOptions,
    pub json: Arc<dyn JsonAdapter>,
    /// How long a remote call may wait for its completion.
    pub invoke_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            session_id: None,
            name: "rewind".into(),
            latency: Duration::from_millis(50),
            max_history: 50,
            stack_trace: StackTraceOptions::default(),
            json: JsonFormat::Compact.adapter(),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .field("name", &self.name)
            .field("latency", &self.latency)
            .field("max_history", &self.max_history)
            .field("stack_trace", &self.stack_trace)
            .field("invoke_timeout", &self.invoke_timeout)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn new(endpoint: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            session_id: Some(SessionId::from_raw(session_id)),
            ..Self::default()
        }
    }

    /// Read endpoint, session and name from `REWIND_*` environment variables.
    pub fn from_env() -> Self {
        let mut opts = Self {
            endpoint: std::env::var(ENV_ENDPOINT).ok(),
            session_id: std::env::var(ENV_SESSION_ID).ok().map(SessionId::from_raw),
            ..Self::default()
        };
        if let Ok(name) = std::env::var(ENV_NAME) {
            opts.name = name;
        }
        opts
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_max_history(mut self, max_history: u16) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Capture a stack for each action, keeping at most `limit` frames
    /// (0 keeps all) and dropping runtime frames.
    pub fn enable_stack_trace(mut self, limit: usize) -> Self {
        self.stack_trace = StackTraceOptions {
            enabled: true,
            limit,
            filter: StackFilter::Default,
        };
        self
    }

    /// Like [`enable_stack_trace`](Self::enable_stack_trace) but only frames
    /// matching `pattern` are kept. An empty pattern keeps every frame.
    pub fn enable_stack_trace_matching(mut self, limit: usize, pattern: &str) -> Result<Self, ConfigError> {
        let filter = if pattern.trim().is_empty() {
            StackFilter::All
        } else {
            StackFilter::Include(
                Regex::new(pattern).map_err(|e| ConfigError::InvalidStackTraceFilter(e.to_string()))?,
            )
        };
        self.stack_trace = StackTraceOptions {
            enabled: true,
            limit,
            filter,
        };
        Ok(self)
    }

    pub fn use_json(mut self, format: JsonFormat) -> Self {
        self.json = format.adapter();
        self
    }

    pub fn use_json_adapter(mut self, adapter: Arc<dyn JsonAdapter>) -> Self {
        self.json = adapter;
        self
    }

    /// Check the required settings and return the endpoint and session.
    pub fn validate(&self) -> Result<(String, SessionId), ConfigError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(ConfigError::MissingEndpoint)?;
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConfigError::InvalidEndpoint {
                uri: endpoint.to_string(),
                reason: "scheme must be ws or wss".into(),
            });
        }
        let session_id = self
            .session_id
            .as_ref()
            .filter(|s| !s.as_str().trim().is_empty())
            .ok_or(ConfigError::MissingSessionId)?;
        Ok((endpoint.to_string(), session_id.clone()))
    }

    /// What gets announced to the inspector on join.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            name: self.name.clone(),
            latency: self.latency.as_millis() as u64,
            max_history: self.max_history,
            stack_trace_enabled: self.stack_trace.enabled,
        }
    }
}
