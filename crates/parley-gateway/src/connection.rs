use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use parley_db::ChatStore;
use parley_types::events::{ChatSubmission, ErrorFrame};
use parley_types::models::{Message as ChatMessage, NewMessage};

use crate::error::ChatError;
use crate::hub::ConnectionHandle;
use crate::{ConnectionSettings, Gateway};

/// Error frames waiting for the writer. Only this connection's own
/// failures land here, so it stays small.
const DIRECT_QUEUE: usize = 16;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    PeerClosed,
    /// Nothing heard from the peer within the pong window.
    Stale,
    Oversized(usize),
    Transport(String),
    WriteTimeout,
    /// The hub closed the delivery queue (eviction or shutdown).
    QueueClosed,
    Cancelled,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::Stale => write!(f, "no traffic within pong window"),
            Self::Oversized(len) => write!(f, "frame of {} bytes exceeds limit", len),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::WriteTimeout => write!(f, "write timed out"),
            Self::QueueClosed => write!(f, "delivery queue closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Serve an upgraded WebSocket already admitted to `conversation_id`.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, user_id: Uuid, conversation_id: Uuid) {
    let (sink, stream) = socket.split();
    run_connection(sink, stream, gateway, user_id, conversation_id).await;
}

/// Register with the hub, run the write worker in its own task and the read
/// worker inline, then unregister once both have wound down.
pub async fn run_connection<S, St, E>(
    sink: S,
    mut stream: St,
    gateway: Gateway,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Disconnect
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let (handle, queue) = ConnectionHandle::new(user_id, conversation_id, gateway.settings.send_queue);
    let connection_id = handle.id;
    let (direct_tx, direct_rx) = mpsc::channel(DIRECT_QUEUE);
    let cancel = gateway.cancellation();

    gateway.hub.register(handle).await;
    info!(
        "User {} connected to conversation {} ({})",
        user_id, conversation_id, connection_id
    );

    let writer = tokio::spawn(write_pump(
        sink,
        queue,
        direct_rx,
        gateway.settings.clone(),
        cancel.clone(),
    ));

    let read_reason = read_pump(&mut stream, &gateway, user_id, conversation_id, &direct_tx, &cancel).await;

    cancel.cancel();
    drop(direct_tx);
    gateway.hub.unregister(conversation_id, connection_id).await;

    let write_reason = match writer.await {
        Ok(reason) => reason,
        Err(e) => {
            error!("Write worker for {} panicked: {}", connection_id, e);
            Disconnect::Cancelled
        }
    };

    // A cancelled reader means the writer stopped first and knows why
    let reason = match read_reason {
        Disconnect::Cancelled => write_reason,
        reason => reason,
    };

    match &reason {
        Disconnect::PeerClosed | Disconnect::Cancelled => info!(
            "User {} disconnected from conversation {}: {}",
            user_id, conversation_id, reason
        ),
        _ => warn!(
            "User {} dropped from conversation {}: {}",
            user_id, conversation_id, reason
        ),
    }
    reason
}

async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Utf8Bytes>,
    mut direct: mpsc::Receiver<Utf8Bytes>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> Disconnect
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = write_frame(&mut sink, Message::Close(None), settings.write_wait).await;
                break Disconnect::Cancelled;
            }
            Some(frame) = direct.recv() => {
                if let Err(reason) = write_frame(&mut sink, Message::Text(frame), settings.write_wait).await {
                    break reason;
                }
            }
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(reason) = write_frame(&mut sink, Message::Text(frame), settings.write_wait).await {
                        break reason;
                    }
                }
                None => {
                    let _ = write_frame(&mut sink, Message::Close(None), settings.write_wait).await;
                    break Disconnect::QueueClosed;
                }
            },
            _ = ping.tick() => {
                trace!("Sending ping");
                if let Err(reason) = write_frame(&mut sink, Message::Ping(Default::default()), settings.write_wait).await {
                    break reason;
                }
            }
        }
    };

    if timeout(settings.write_wait, sink.close()).await.is_err() {
        debug!("Timed out closing sink");
    }
    cancel.cancel();
    reason
}

async fn write_frame<S>(sink: &mut S, frame: Message, write_wait: Duration) -> Result<(), Disconnect>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Disconnect::Transport(e.to_string())),
        Err(_) => Err(Disconnect::WriteTimeout),
    }
}

async fn read_pump<St, E>(
    stream: &mut St,
    gateway: &Gateway,
    user_id: Uuid,
    conversation_id: Uuid,
    direct: &mpsc::Sender<Utf8Bytes>,
    cancel: &CancellationToken,
) -> Disconnect
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let settings = &gateway.settings;

    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Disconnect::Cancelled,
            next = timeout(settings.pong_wait, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return Disconnect::Stale,
            Ok(None) => return Disconnect::PeerClosed,
            Ok(Some(Err(e))) => return Disconnect::Transport(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        let payload: &[u8] = match &frame {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Pong(_) => {
                trace!("Pong from {}", user_id);
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => return Disconnect::PeerClosed,
        };

        if payload.len() > settings.max_message_size {
            return Disconnect::Oversized(payload.len());
        }

        handle_payload(gateway, user_id, conversation_id, payload, direct).await;
    }
}

async fn handle_payload(
    gateway: &Gateway,
    user_id: Uuid,
    conversation_id: Uuid,
    payload: &[u8],
    direct: &mpsc::Sender<Utf8Bytes>,
) {
    let submission: ChatSubmission = match serde_json::from_slice(payload) {
        Ok(submission) => submission,
        Err(e) => {
            warn!(
                "User {} sent a bad frame in conversation {}: {}",
                user_id, conversation_id, e
            );
            send_error(direct, format!("Invalid message format: {}", e));
            return;
        }
    };

    let new = submission.into_new_message(user_id, conversation_id);
    match persist(gateway.store.clone(), new).await {
        Ok(message) => {
            debug!("Message {} saved in conversation {}", message.id, conversation_id);
            gateway.hub.broadcast(message).await;
        }
        Err(e) => {
            error!(
                "Failed to save message from {} in conversation {}: {}",
                user_id, conversation_id, e
            );
            send_error(direct, format!("Failed to send message: {}", e));
        }
    }
}

async fn persist(store: std::sync::Arc<dyn ChatStore>, new: NewMessage) -> Result<ChatMessage, ChatError> {
    Ok(tokio::task::spawn_blocking(move || store.send_message(&new)).await??)
}

fn send_error(direct: &mpsc::Sender<Utf8Bytes>, message: String) {
    match serde_json::to_string(&ErrorFrame::new(message)) {
        Ok(json) => {
            if direct.try_send(json.into()).is_err() {
                warn!("Dropping error frame, writer is backed up");
            }
        }
        Err(e) => error!("Failed to render error frame: {}", e),
    }
}
