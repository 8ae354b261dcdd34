//! Shared queue-status channel.
//!
//! One connection to `{ws|wss}://{host}/queue/status/ws`. Every snapshot is
//! broadcast as-is to all subscribers. Subscribing does not depend on the
//! connection state, and late subscribers only see snapshots received after
//! they subscribed.

use std::sync::Arc;

use tracing::warn;

use crate::connection::{Connection, ConnectionOptions};
use crate::endpoints;
use crate::models::QueueStatus;
use crate::status::ConnectionStatus;
use crate::subscribers::{SubscriptionId, Subscribers};

pub struct QueueStatusChannel {
    connection: Connection,
    subscribers: Arc<Subscribers<QueueStatus>>,
}

impl QueueStatusChannel {
    pub fn new(options: ConnectionOptions) -> Self {
        let connection = Connection::new("queue", options);
        let subscribers: Arc<Subscribers<QueueStatus>> = Arc::new(Subscribers::new());

        let fan_out = Arc::clone(&subscribers);
        connection.subscribe(move |payload| {
            match serde_json::from_value::<QueueStatus>(payload.clone()) {
                Ok(snapshot) => fan_out.emit(&snapshot),
                Err(e) => warn!("queue: dropping unexpected snapshot: {e}"),
            }
        });

        Self {
            connection,
            subscribers,
        }
    }

    /// Connect to the queue stream on the host of the HTTP API `base_url`.
    pub async fn connect(&self, base_url: &str) -> bool {
        match endpoints::queue_status_url(base_url) {
            Ok(url) => self.connection.connect(url.as_str()).await,
            Err(e) => {
                warn!("queue: {e}");
                false
            }
        }
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QueueStatus) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscribe_status<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.connection.subscribe_status(listener)
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        self.connection.unsubscribe_status(id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Connected with no outstanding error. HTTP polling is skipped while true.
    pub fn is_healthy(&self) -> bool {
        self.connection.status().is_healthy()
    }
}
