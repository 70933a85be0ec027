use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rewind_core::FeatureError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClientError;

/// An action as middleware sees it: display type name plus serialized payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchedAction {
    type_name: String,
    payload: Value,
}

impl DispatchedAction {
    pub fn new<A: Serialize + 'static>(action: &A) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_name: action_type_name::<A>(),
            payload: serde_json::to_value(action)?,
        })
    }

    pub fn from_parts(type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// `"Name, module::path"`, or `"Name<Args>, module::path"` for generic types.
pub fn action_type_name<A: ?Sized>() -> String {
    let full = std::any::type_name::<A>();
    let (path, generics) = match full.find('<') {
        Some(i) => full.split_at(i),
        None => (full, ""),
    };
    match path.rsplit_once("::") {
        Some((module, name)) => format!("{name}{generics}, {module}"),
        None => full.to_string(),
    }
}

/// A feature's next state, computed but not yet installed. Calling it
/// installs the state.
pub type StagedState<'a> = Box<dyn FnOnce() + Send + 'a>;

/// One named slice of application state.
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;

    /// Rust type name of the state, for diagnostics.
    fn state_type(&self) -> &'static str;

    fn state(&self) -> Result<Value, serde_json::Error>;

    /// Replace the state with a value received from the inspector.
    fn restore_state(&self, state: Value) -> Result<(), FeatureError>;

    /// Compute the state after `action` without installing it. `None` when
    /// the action does not apply to this feature.
    fn reduce(&self, _action: &DispatchedAction) -> Result<Option<StagedState<'_>>, FeatureError> {
        Ok(None)
    }
}

/// Anything exposing an enumerable set of features.
pub trait StateContainer: Send + Sync {
    /// All features, ordered by name.
    fn features(&self) -> Vec<Arc<dyn Feature>>;

    fn feature(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.features().into_iter().find(|f| f.name() == name)
    }

    /// Run `f` with no dispatch in progress.
    fn exclusive(&self, f: &mut dyn FnMut()) {
        f()
    }
}

/// Hooks run around every dispatch.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn initialize(&self, container: Arc<dyn StateContainer>) -> Result<(), ClientError>;

    /// Returning false rejects the action before any reducer runs.
    fn may_dispatch(&self, _action: &DispatchedAction) -> bool {
        true
    }

    fn after_dispatch(&self, _action: &DispatchedAction) {}
}

type Reducer<S> = Box<dyn Fn(&S, &Value) -> Result<S, FeatureError> + Send + Sync>;

/// Feature backed by a concrete serde type with per-action reducers.
pub struct TypedFeature<S> {
    name: String,
    state: RwLock<S>,
    reducers: HashMap<String, Reducer<S>>,
}

impl<S> TypedFeature<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(initial),
            reducers: HashMap::new(),
        }
    }

    /// Register a reducer for actions of type `A`.
    pub fn on<A, F>(mut self, reducer: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(&S, A) -> S + Send + Sync + 'static,
    {
        let key = action_type_name::<A>();
        let action_name = key.clone();
        self.reducers.insert(
            key,
            Box::new(move |state: &S, payload: &Value| {
                let action: A = serde_json::from_value(payload.clone()).map_err(|e| FeatureError::Reducer {
                    action: action_name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(reducer(state, action))
            }),
        );
        self
    }

    pub fn get(&self) -> S
    where
        S: Clone,
    {
        self.state.read().clone()
    }
}

impl<S> Feature for TypedFeature<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&*self.state.read())
    }

    fn restore_state(&self, state: Value) -> Result<(), FeatureError> {
        let typed: S = serde_json::from_value(state).map_err(|source| FeatureError::StateMismatch {
            feature: self.name.clone(),
            source,
        })?;
        *self.state.write() = typed;
        Ok(())
    }

    fn reduce(&self, action: &DispatchedAction) -> Result<Option<StagedState<'_>>, FeatureError> {
        let Some(reducer) = self.reducers.get(action.type_name()) else {
            return Ok(None);
        };
        let next = reducer(&*self.state.read(), action.payload())?;
        Ok(Some(Box::new(move || *self.state.write() = next)))
    }
}

/// Minimal in-process state container: features, reducers, middleware.
pub struct Store {
    features: BTreeMap<String, Arc<dyn Feature>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    dispatching: Mutex<()>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            features: BTreeMap::new(),
            middlewares: Vec::new(),
            dispatching: Mutex::new(()),
        }
    }

    pub fn with_feature(mut self, feature: Arc<dyn Feature>) -> Self {
        self.features.insert(feature.name().to_string(), feature);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Initialize every middleware in registration order.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ClientError> {
        let container: Arc<dyn StateContainer> = Arc::clone(self) as Arc<dyn StateContainer>;
        for middleware in &self.middlewares {
            middleware.initialize(Arc::clone(&container)).await?;
        }
        Ok(())
    }

    /// Dispatch a typed action. Returns `Ok(false)` when a middleware rejected it.
    pub fn dispatch<A: Serialize + 'static>(&self, action: &A) -> Result<bool, ClientError> {
        let action = DispatchedAction::new(action)?;
        self.dispatch_action(&action)
    }

    pub fn dispatch_action(&self, action: &DispatchedAction) -> Result<bool, ClientError> {
        let _serial = self.dispatching.lock();

        if !self.middlewares.iter().all(|m| m.may_dispatch(action)) {
            debug!(action = action.type_name(), "dispatch rejected by middleware");
            return Ok(false);
        }
        // Nothing is installed unless every reducer succeeds.
        let mut staged = Vec::with_capacity(self.features.len());
        for feature in self.features.values() {
            match feature.reduce(action) {
                Ok(Some(next)) => staged.push(next),
                Ok(None) => {}
                Err(e) => {
                    warn!(feature = feature.name(), action = action.type_name(), error = %e, "reducer failed, action discarded");
                    return Err(e.into());
                }
            }
        }
        for install in staged {
            install();
        }
        for middleware in &self.middlewares {
            middleware.after_dispatch(action);
        }
        Ok(true)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl StateContainer for Store {
    fn features(&self) -> Vec<Arc<dyn Feature>> {
        self.features.values().cloned().collect()
    }

    fn feature(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.features.get(name).cloned()
    }

    fn exclusive(&self, f: &mut dyn FnMut()) {
        let _serial = self.dispatching.lock();
        f()
    }
}
