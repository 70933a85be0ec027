use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rewind_core::protocol::{methods, ActionInfo, JumpToStateCallback, SessionOptions};
use rewind_core::{ConfigError, JsonAdapter, SessionId, TransportError};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::ClientError;
use crate::gate::{GateState, SequenceGate};
use crate::options::ClientOptions;
use crate::queue::OrderedDispatchQueue;
use crate::stack::StackTraceOptions;
use crate::store::{DispatchedAction, Feature, Middleware, StateContainer};
use crate::transport::{handler, Transport};
use crate::ws::WsTransport;

/// Mirrors a state container to a remote inspector and applies its
/// time-travel commands.
///
/// Every accepted dispatch is forwarded as `Dispatch(action, state, stack)`
/// through an [`OrderedDispatchQueue`]. While the inspector is viewing an
/// older state the [`SequenceGate`] is historical and new dispatches are
/// rejected until the inspector commits or jumps back to the newest state.
pub struct SyncMiddleware {
    session_id: SessionId,
    session_options: SessionOptions,
    stack_trace: StackTraceOptions,
    json: Arc<dyn JsonAdapter>,
    transport: Arc<dyn Transport>,
    gate: Mutex<SequenceGate>,
    queue: OrderedDispatchQueue,
    container: OnceLock<Weak<dyn StateContainer>>,
    external_changes: AtomicUsize,
}

/// Marks state changes applied on the inspector's behalf. Local dispatches
/// are rejected while a scope is alive.
pub struct ExternalChangeScope<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for ExternalChangeScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SyncMiddleware {
    /// Validate `options` and wire the inspector callbacks into `transport`.
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Arc<Self>, ConfigError> {
        let (_, session_id) = options.validate()?;
        let middleware = Arc::new(Self {
            session_id,
            session_options: options.session_options(),
            stack_trace: options.stack_trace.clone(),
            json: Arc::clone(&options.json),
            transport,
            gate: Mutex::new(SequenceGate::new()),
            queue: OrderedDispatchQueue::new(),
            container: OnceLock::new(),
            external_changes: AtomicUsize::new(0),
        });
        middleware.register_handlers();
        Ok(middleware)
    }

    /// Same as [`new`](Self::new) over a [`WsTransport`] to `options.endpoint`.
    pub fn websocket(options: ClientOptions) -> Result<Arc<Self>, ConfigError> {
        let (endpoint, _) = options.validate()?;
        let transport = Arc::new(WsTransport::new(endpoint, options.invoke_timeout));
        Self::new(options, transport)
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.transport.on(
            methods::ON_JUMP_TO_STATE,
            handler(move |args| {
                let weak = weak.clone();
                async move {
                    let Some(this) = weak.upgrade() else { return };
                    let callback = match args.first().map(parse_jump_callback) {
                        Some(Ok(cb)) => cb,
                        Some(Err(e)) => {
                            warn!(error = %e, "ignoring malformed jump request");
                            return;
                        }
                        None => {
                            warn!("jump request without payload");
                            return;
                        }
                    };
                    if let Err(e) = this.on_jump_to_state(callback).await {
                        warn!(error = %e, "jump to state failed");
                    }
                }
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        self.transport.on(
            methods::ON_COMMIT,
            handler(move |_| {
                let weak = weak.clone();
                async move {
                    let Some(this) = weak.upgrade() else { return };
                    if let Err(e) = this.on_commit().await {
                        warn!(error = %e, "commit failed");
                    }
                }
            }),
        );
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.lock().state()
    }

    /// `(current, latest)` version counters.
    pub fn versions(&self) -> (u64, u64) {
        let gate = self.gate.lock();
        (gate.current(), gate.latest())
    }

    /// Wait for every queued notification to be attempted.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    pub fn begin_external_change(&self) -> ExternalChangeScope<'_> {
        self.external_changes.fetch_add(1, Ordering::AcqRel);
        ExternalChangeScope {
            depth: &self.external_changes,
        }
    }

    pub fn is_applying_external_change(&self) -> bool {
        self.external_changes.load(Ordering::Acquire) > 0
    }

    /// Connect, join the session and send the initial snapshot.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn initialize(&self, container: Arc<dyn StateContainer>) -> Result<(), ClientError> {
        self.container
            .set(Arc::downgrade(&container))
            .map_err(|_| ClientError::AlreadyInitialized)?;

        self.transport.connect().await?;
        let options = serde_json::to_value(&self.session_options)?;
        self.transport
            .invoke(
                methods::JOIN_SESSION,
                vec![Value::String(self.session_id.to_string()), options],
            )
            .await?;

        let state = self.snapshot_json()?;
        self.transport
            .invoke(methods::INITIALIZE, vec![Value::String(state)])
            .await?;
        info!(name = %self.session_options.name, "joined session");
        Ok(())
    }

    /// Flush queued notifications, then close the transport.
    pub async fn close(&self) {
        self.queue.drain().await;
        self.transport.close().await;
        info!(session_id = %self.session_id, "sync middleware closed");
    }

    /// False while the inspector is viewing history or its state is being
    /// installed.
    pub fn before_dispatch(&self, action: &DispatchedAction) -> bool {
        if self.is_applying_external_change() {
            debug!(action = action.type_name(), "dispatch blocked while restoring state");
            return false;
        }
        let allowed = self.gate.lock().may_proceed();
        if !allowed {
            debug!(action = action.type_name(), "dispatch blocked while viewing history");
        }
        allowed
    }

    /// Queue `Dispatch` for an accepted action and advance the gate.
    pub fn after_dispatch(&self, action: &DispatchedAction) {
        if self.is_applying_external_change() {
            return;
        }
        let stack = self.stack_trace.capture();

        let mut gate = self.gate.lock();
        match self.dispatch_args(action, stack) {
            Ok(args) => {
                self.enqueue_invoke(methods::DISPATCH, args);
            }
            Err(e) => warn!(action = action.type_name(), error = %e, "failed to encode dispatch"),
        }
        gate.record_change();
    }

    /// Drain, re-send the full state as the new baseline, then fork history
    /// at the viewed version.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn on_commit(&self) -> Result<(), ClientError> {
        self.queue.drain().await;
        let sent = {
            let mut gate = self.gate.lock();
            let state = self.snapshot_json();
            gate.commit();
            let state = state?;
            self.enqueue_call(methods::INITIALIZE, vec![Value::String(state)])
        };
        info!("history committed");
        sent.await.unwrap_or(Err(TransportError::Closed))?;
        Ok(())
    }

    /// Move the gate to `actionId` and install the snapshot's feature states
    /// once every earlier notification has been sent. Returns how many
    /// features were restored.
    ///
    /// The gate move and the restore run inside
    /// [`StateContainer::exclusive`], so no dispatch interleaves with them.
    #[instrument(skip_all, fields(session_id = %self.session_id, action_id = callback.payload.action_id))]
    pub async fn on_jump_to_state(&self, callback: JumpToStateCallback) -> Result<usize, ClientError> {
        let container = self.container()?;
        let Value::Object(snapshot) = self.json.deserialize(&callback.state)? else {
            return Err(ClientError::InvalidSnapshot);
        };
        let mut entries = self.resolve_features(container.as_ref(), snapshot);
        let action_id = callback.payload.action_id;

        loop {
            self.queue.drain().await;
            let mut restored = None;
            container.exclusive(&mut || {
                // A dispatch accepted during the drain queued another send.
                if self.queue.pending() > 0 {
                    return;
                }
                self.gate.lock().jump_to(action_id);
                let _scope = self.begin_external_change();
                restored = Some(restore_features(&mut entries));
            });
            if let Some(restored) = restored {
                debug!(restored, state = ?self.gate_state(), "state restored");
                return Ok(restored);
            }
            trace!("sends queued during drain, draining again");
        }
    }

    fn container(&self) -> Result<Arc<dyn StateContainer>, ClientError> {
        self.container
            .get()
            .and_then(Weak::upgrade)
            .ok_or(ClientError::NotInitialized)
    }

    /// Pair each known feature with its decoded state. String values are
    /// parsed as JSON first.
    fn resolve_features(
        &self,
        container: &dyn StateContainer,
        snapshot: Map<String, Value>,
    ) -> Vec<(Arc<dyn Feature>, Value)> {
        let mut entries = Vec::with_capacity(snapshot.len());
        for (name, value) in snapshot {
            let Some(feature) = container.feature(&name) else {
                debug!(feature = %name, "no such feature, skipping");
                continue;
            };
            let value = match value {
                Value::String(text) => match self.json.deserialize(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(feature = %name, error = %e, "feature state is not valid JSON");
                        continue;
                    }
                },
                other => other,
            };
            entries.push((feature, value));
        }
        entries
    }

    /// Feature name → state, ordered by name.
    fn snapshot(&self) -> Result<Value, ClientError> {
        let container = self.container()?;
        let mut map = Map::new();
        for feature in container.features() {
            map.insert(feature.name().to_string(), feature.state()?);
        }
        Ok(Value::Object(map))
    }

    fn snapshot_json(&self) -> Result<String, ClientError> {
        let snapshot = self.snapshot()?;
        Ok(self.json.serialize(&snapshot)?)
    }

    fn dispatch_args(&self, action: &DispatchedAction, stack: Option<String>) -> Result<Vec<Value>, ClientError> {
        let info = ActionInfo {
            action_type: action.type_name().to_string(),
            payload: action.payload().clone(),
        };
        let action_json = self.json.serialize(&serde_json::to_value(&info)?)?;
        let state_json = self.snapshot_json()?;
        let stack_json = match stack {
            Some(stack) => Value::String(self.json.serialize(&Value::String(stack))?),
            None => Value::Null,
        };
        Ok(vec![Value::String(action_json), Value::String(state_json), stack_json])
    }

    fn enqueue_invoke(&self, method: &'static str, args: Vec<Value>) -> u64 {
        let transport = Arc::clone(&self.transport);
        self.queue
            .enqueue(move || async move { transport.invoke(method, args).await })
    }

    /// Queue an invoke and hand back its outcome.
    fn enqueue_call(
        &self,
        method: &'static str,
        args: Vec<Value>,
    ) -> oneshot::Receiver<Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        self.queue.enqueue(move || async move {
            let result = transport.invoke(method, args).await;
            let _ = tx.send(result.clone());
            result
        });
        rx
    }
}

#[async_trait]
impl Middleware for SyncMiddleware {
    async fn initialize(&self, container: Arc<dyn StateContainer>) -> Result<(), ClientError> {
        SyncMiddleware::initialize(self, container).await
    }

    fn may_dispatch(&self, action: &DispatchedAction) -> bool {
        self.before_dispatch(action)
    }

    fn after_dispatch(&self, action: &DispatchedAction) {
        SyncMiddleware::after_dispatch(self, action)
    }
}

fn restore_features(entries: &mut Vec<(Arc<dyn Feature>, Value)>) -> usize {
    let mut restored = 0;
    for (feature, value) in entries.drain(..) {
        match feature.restore_state(value) {
            Ok(()) => restored += 1,
            Err(e) => warn!(feature = feature.name(), error = %e, "failed to restore feature state"),
        }
    }
    restored
}

/// Accepts the callback as an object or as JSON text.
fn parse_jump_callback(value: &Value) -> Result<JumpToStateCallback, serde_json::Error> {
    match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    }
}
