use crate::types::Message;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast::{self, Sender};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error};
use uuid::Uuid;

const CAPACITY: usize = 64;

/// Delivers freshly stored messages to connected recipients.
#[cfg_attr(test, mockall::automock)]
pub trait MessageBroadcaster: Send + Sync {
    fn publish(&self, recipient: Uuid, message: &Message);
}

/// Live connections keyed by identity. Owned by the server process and
/// handed to whoever needs to publish.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    channels: Arc<Mutex<HashMap<Uuid, Sender<Message>>>>,
}

impl ConnectionRegistry {
    pub fn subscribe(&self, user_id: Uuid) -> BroadcastStream<Message> {
        let receiver = match self.channels.lock() {
            Ok(mut channels) => {
                // Drop identities whose streams have all gone away.
                channels.retain(|_, sender| sender.receiver_count() > 0);
                channels
                    .entry(user_id)
                    .or_insert_with(|| broadcast::channel(CAPACITY).0)
                    .subscribe()
            }
            Err(err) => {
                error!(%err, "Connection registry is poisoned");
                // A detached receiver still yields a well-formed, silent stream.
                broadcast::channel(1).0.subscribe()
            }
        };
        BroadcastStream::new(receiver)
    }

    pub fn connections(&self, user_id: Uuid) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&user_id).map(Sender::receiver_count))
            .unwrap_or(0)
    }
}

impl MessageBroadcaster for ConnectionRegistry {
    fn publish(&self, recipient: Uuid, message: &Message) {
        let Ok(mut channels) = self.channels.lock() else {
            error!("Connection registry is poisoned, dropping message {}", message.id);
            return;
        };
        let Some(sender) = channels.get(&recipient) else {
            debug!(%recipient, "Recipient is not connected");
            return;
        };
        if sender.send(message.clone()).is_err() {
            // Every receiver of this identity is gone.
            channels.remove(&recipient);
            debug!(%recipient, "Dropped stale connection entry");
        }
    }
}
