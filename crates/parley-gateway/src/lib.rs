pub mod connection;
pub mod error;
pub mod hub;
pub mod resolver;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::ChatStore;

pub use error::ChatError;
pub use hub::{Hub, HubStats};
pub use resolver::ConversationResolver;

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_size: usize,
    pub send_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
            send_queue: 256,
        }
    }
}

/// Everything a live connection needs: the hub, the store and its limits,
/// plus the bookkeeping to stop every connection at shutdown.
#[derive(Clone)]
pub struct Gateway {
    pub hub: Hub,
    pub store: Arc<dyn ChatStore>,
    pub settings: ConnectionSettings,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Gateway {
    pub fn new(hub: Hub, store: Arc<dyn ChatStore>, settings: ConnectionSettings) -> Self {
        Self {
            hub,
            store,
            settings,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn resolver(&self) -> ConversationResolver {
        ConversationResolver::new(self.store.clone())
    }

    /// Drive an upgraded socket until it disconnects. The returned future is
    /// tracked so shutdown can wait for it.
    pub fn serve(self, socket: WebSocket, user_id: Uuid, conversation_id: Uuid) -> impl Future<Output = ()> + Send {
        let tracker = self.tracker.clone();
        tracker.track_future(async move {
            connection::handle_connection(socket, self, user_id, conversation_id).await;
        })
    }

    /// Connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.tracker.len()
    }

    /// True once [`Gateway::shutdown`] has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every connection, close every delivery queue, then wait up to
    /// `grace` for connection tasks to finish. Returns false if some were
    /// still running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();

        let closed = self.hub.shutdown().await;
        info!(
            "Gateway shutting down: {} registered, {} tasks running",
            closed,
            self.live_connections()
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} connections still running after {:?}, giving up",
                self.live_connections(),
                grace
            );
            return false;
        }
        true
    }

    fn cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
