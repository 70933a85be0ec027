//! WebSocket [`Transport`] speaking the relay's frame protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rewind_core::protocol::Frame;
use rewind_core::{ProtocolError, TransportError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::transport::{RemoteHandler, Transport};

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<(), TransportError>>,
}

struct Inbound {
    id: Option<u64>,
    method: String,
    args: Vec<Value>,
}

/// Client side of a relay connection.
///
/// A reader task routes completions to waiting callers and hands inbound
/// invocations to a single handler task, so handlers run sequentially and
/// never stall the reader.
pub struct WsTransport {
    endpoint: String,
    invoke_timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, PendingCall>>,
    handlers: Arc<DashMap<String, RemoteHandler>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, invoke_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            invoke_timeout,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
            outbound: Arc::new(Mutex::new(None)),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.to_text()?;
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Message::text(text)).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&self) -> Result<(), TransportError> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let (stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Inbound>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let handlers = Arc::clone(&self.handlers);
        let reply_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(Inbound { id, method, args }) = in_rx.recv().await {
                let handler = handlers.get(&method).map(|h| Arc::clone(h.value()));
                let reply = match handler {
                    Some(handler) => {
                        handler(args).await;
                        id.map(Frame::completed)
                    }
                    None => {
                        warn!(method = %method, "no handler for remote invocation");
                        id.map(|id| Frame::failed(id, &ProtocolError::MethodNotFound(method)))
                    }
                };
                if let Some(frame) = reply {
                    match frame.to_text() {
                        Ok(text) => {
                            let _ = reply_tx.send(Message::text(text));
                        }
                        Err(e) => warn!(error = %e, "failed to encode completion"),
                    }
                }
            }
        });

        let pending = Arc::clone(&self.pending);
        let outbound = Arc::clone(&self.outbound);
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                };
                match Frame::parse(text.as_str()) {
                    Ok(Frame::Completion { id, success, error }) => {
                        let Some((_, call)) = pending.remove(&id) else {
                            debug!(id, "completion for unknown call");
                            continue;
                        };
                        let result = if success {
                            Ok(())
                        } else {
                            let error = error.unwrap_or_else(|| rewind_core::protocol::RemoteError {
                                code: "INTERNAL_ERROR".into(),
                                message: "remote call failed".into(),
                            });
                            Err(TransportError::Remote {
                                method: call.method,
                                code: error.code,
                                message: error.message,
                            })
                        };
                        let _ = call.tx.send(result);
                    }
                    Ok(Frame::Invoke { id, method, args }) => {
                        if in_tx.send(Inbound { id, method, args }).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                }
            }

            outbound.lock().take();
            let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, call)) = pending.remove(&id) {
                    let _ = call.tx.send(Err(TransportError::Closed));
                }
            }
            info!(endpoint = %endpoint, "relay connection closed");
        });

        *self.outbound.lock() = Some(out_tx);
        info!("connected to relay");
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        if let Err(e) = self.send_frame(&Frame::invoke(id, method, args)) {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout: self.invoke_timeout,
                })
            }
        }
    }

    fn on(&self, method: &str, handler: RemoteHandler) {
        self.handlers.insert(method.to_string(), handler);
    }

    async fn close(&self) {
        let tx = self.outbound.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handler;
    use rewind_core::protocol::methods;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// One-connection server: replies to invokes per `respond`, and pushes
    /// `push` frames right after the handshake.
    async fn serve_once<F>(push: Vec<Frame>, respond: F) -> (String, mpsc::UnboundedReceiver<Frame>)
    where
        F: Fn(&Frame) -> Option<Frame> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for frame in push {
                ws.send(Message::text(frame.to_text().unwrap())).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let frame = Frame::parse(text.as_str()).unwrap();
                    if let Some(reply) = respond(&frame) {
                        ws.send(Message::text(reply.to_text().unwrap())).await.unwrap();
                    }
                    let _ = seen_tx.send(frame);
                }
            }
        });
        (format!("ws://{addr}"), seen_rx)
    }

    fn ack(frame: &Frame) -> Option<Frame> {
        match frame {
            Frame::Invoke { id: Some(id), .. } => Some(Frame::completed(*id)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn invoke_waits_for_completion() {
        let (url, mut seen) = serve_once(vec![], ack).await;
        let transport = WsTransport::new(url, Duration::from_secs(5));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport
            .invoke(methods::INITIALIZE, vec![json!("{}")])
            .await
            .unwrap();

        match seen.recv().await.unwrap() {
            Frame::Invoke { id, method, args } => {
                assert!(id.is_some());
                assert_eq!(method, "Initialize");
                assert_eq!(args, vec![json!("{}")]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_completion_maps_to_remote_error() {
        let (url, _seen) = serve_once(vec![], |frame| match frame {
            Frame::Invoke { id: Some(id), .. } => Some(Frame::failed(*id, &ProtocolError::NoSessionJoined)),
            _ => None,
        })
        .await;
        let transport = WsTransport::new(url, Duration::from_secs(5));
        transport.connect().await.unwrap();

        let err = transport.invoke(methods::DISPATCH, vec![]).await.unwrap_err();
        match err {
            TransportError::Remote { method, code, .. } => {
                assert_eq!(method, "Dispatch");
                assert_eq!(code, "NO_SESSION");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_times_out_without_completion() {
        let (url, _seen) = serve_once(vec![], |_| None).await;
        let transport = WsTransport::new(url, Duration::from_millis(100));
        transport.connect().await.unwrap();

        let err = transport.invoke(methods::DISPATCH, vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn concurrent_connects_open_one_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    let _ = accepted_tx.send(());
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let transport = WsTransport::new(format!("ws://{addr}"), Duration::from_secs(5));
        let (a, b) = tokio::join!(transport.connect(), transport.connect());
        a.unwrap();
        b.unwrap();
        assert!(transport.is_connected());

        accepted.recv().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(200), accepted.recv()).await;
        assert!(second.is_err(), "a second socket was opened");
    }

    #[tokio::test]
    async fn invoke_before_connect_fails() {
        let transport = WsTransport::new("ws://127.0.0.1:1", Duration::from_secs(1));
        let err = transport.invoke(methods::DISPATCH, vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = WsTransport::new(format!("ws://{addr}"), Duration::from_secs(1));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn inbound_invocations_reach_handlers_in_order() {
        let push = vec![
            Frame::notify(methods::ON_JUMP_TO_STATE, vec![json!(1)]),
            Frame::notify(methods::ON_JUMP_TO_STATE, vec![json!(2)]),
            Frame::invoke(9, methods::ON_COMMIT, vec![]),
        ];
        let (url, mut seen) = serve_once(push, |_| None).await;
        let transport = WsTransport::new(url, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let jump_tx = tx.clone();
        transport.on(
            methods::ON_JUMP_TO_STATE,
            handler(move |args| {
                let tx = jump_tx.clone();
                async move {
                    // Slow first handler must not let the second overtake it.
                    if args[0] == json!(1) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    let _ = tx.send(format!("jump {}", args[0]));
                }
            }),
        );
        transport.on(
            methods::ON_COMMIT,
            handler(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send("commit".to_string());
                }
            }),
        );
        transport.connect().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "jump 1");
        assert_eq!(rx.recv().await.unwrap(), "jump 2");
        assert_eq!(rx.recv().await.unwrap(), "commit");

        // The invoke with an id gets a completion back.
        assert_eq!(seen.recv().await.unwrap(), Frame::completed(9));
    }

    #[tokio::test]
    async fn pending_calls_fail_when_connection_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // Read the invoke, then hang up without answering.
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let transport = WsTransport::new(format!("ws://{addr}"), Duration::from_secs(5));
        transport.connect().await.unwrap();
        let err = transport.invoke(methods::INITIALIZE, vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
