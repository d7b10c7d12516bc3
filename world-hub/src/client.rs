//! A [`Transport`] that reaches a remote authority over `/ws`.

use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use world_hub_core::error::TransportError;
use world_hub_core::transport::WorldSnapshot;
use world_hub_core::{Registry, Request, Response, Transport, UserId};

/// How a connection identifies its user.
#[derive(Clone, Debug)]
pub enum Credentials {
    Token(String),
    User(UserId),
}

fn protocol(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<ServerMessage, TransportError>>>>>;

pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    broadcasts: Mutex<Option<mpsc::UnboundedReceiver<Response>>>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(url: &str, credentials: Credentials) -> Result<Self, TransportError> {
        let mut request = url.into_client_request().map_err(protocol)?;
        let (name, value) = match &credentials {
            Credentials::Token(token) => ("Authorization", format!("Bearer {token}")),
            Credentials::User(user) => ("X-User-Id", user.to_string()),
        };
        let value = HeaderValue::from_str(&value).map_err(protocol)?;
        request.headers_mut().insert(name, value);

        let (stream, _) = connect_async(request).await.map_err(|err| {
            tracing::warn!(%url, error = %err, "connection failed");
            TransportError::Disconnected
        })?;
        let (mut sink, mut stream) = stream.split();

        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if sink.send(message).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let pending: Pending = Arc::default();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(frame) = stream.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let message = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(error = %err, "unreadable server message");
                            continue;
                        }
                    };
                    route(&pending, &broadcast_tx, message);
                }
                tracing::debug!("connection closed");
                pending.lock().clear();
            }
        });

        Ok(Self {
            outgoing,
            pending,
            broadcasts: Mutex::new(Some(broadcast_rx)),
            reader,
        })
    }

    /// Changes made by other sessions. Yields once; later calls return `None`.
    pub fn broadcasts(&self) -> Option<UnboundedReceiverStream<Response>> {
        self.broadcasts.lock().take().map(UnboundedReceiverStream::new)
    }

    /// Apply every broadcast to `registry` until the connection closes.
    pub fn follow(&self, registry: Registry) -> Option<JoinHandle<()>> {
        let mut broadcasts = self.broadcasts()?;
        Some(tokio::spawn(async move {
            while let Some(response) = broadcasts.next().await {
                if let Err(err) = registry.apply_remote(&response) {
                    tracing::warn!(
                        request_id = %response.request.request_id,
                        error = %err,
                        "failed to apply remote change"
                    );
                }
            }
        }))
    }

    async fn call(&self, message: ClientMessage) -> Result<ServerMessage, TransportError> {
        let request_id = message.request_id();
        let text = serde_json::to_string(&message).map_err(protocol)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        if self.outgoing.send(Message::Text(text.into())).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::Disconnected);
        }
        rx.await.map_err(|_| TransportError::Disconnected)?
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn route(pending: &Pending, broadcasts: &mpsc::UnboundedSender<Response>, message: ServerMessage) {
    let Some(request_id) = message.reply_to() else {
        if let ServerMessage::Broadcast(response) = message {
            let _ = broadcasts.send(response);
        }
        return;
    };
    let Some(waiter) = pending.lock().remove(&request_id) else {
        tracing::debug!(%request_id, "reply to an unknown request");
        return;
    };
    let reply = match message {
        ServerMessage::Rejected { reason, .. } => Err(TransportError::Rejected(reason)),
        other => Ok(other),
    };
    let _ = waiter.send(reply);
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        match self.call(ClientMessage::Request(request)).await? {
            ServerMessage::Response(response) => Ok(response),
            other => Err(protocol(format!("expected a response, got {other:?}"))),
        }
    }

    async fn world(&self) -> Result<WorldSnapshot, TransportError> {
        let message = ClientMessage::World {
            request_id: Uuid::new_v4(),
        };
        match self.call(message).await? {
            ServerMessage::World { snapshot, .. } => Ok(snapshot),
            other => Err(protocol(format!("expected a world snapshot, got {other:?}"))),
        }
    }
}
