use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use rewind_core::TransportError;
use serde_json::Value;

/// Callback run when the remote side invokes a method on us.
pub type RemoteHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`RemoteHandler`].
pub fn handler<F, Fut>(f: F) -> RemoteHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Bidirectional remote-method transport.
///
/// Handlers registered with [`on`](Transport::on) for one connection run one
/// at a time, in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Call `method` on the remote side and wait for it to complete.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), TransportError>;

    fn on(&self, method: &str, handler: RemoteHandler);

    async fn close(&self) {}
}
