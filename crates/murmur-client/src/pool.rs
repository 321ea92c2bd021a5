// Client-side multiplexer: at most one live subscription per logical id.
use std::collections::HashMap;

use anyhow::Result;
use murmur_wire::Envelope;
use parking_lot::Mutex;

use crate::client::Client;
use crate::subscription::Subscription;

/// Tracks caller-assigned logical ids against their last-sent subscribe
/// envelope, so restarting an id replaces the server-side subscription
/// instead of stacking a second one.
#[derive(Default)]
pub struct SubscriptionPool {
    streams: Mutex<HashMap<u64, Envelope>>,
}

impl SubscriptionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `id` to the given subscribe envelope. If the id already
    /// holds a live envelope its header is unsubscribed first, so at most
    /// one subscription is live per id at any time.
    pub async fn start(
        &self,
        client: &Client,
        id: u64,
        message: Envelope,
    ) -> Result<Subscription> {
        let previous = self.streams.lock().insert(id, message.clone());
        if let Some(old) = previous {
            Self::unsubscribe(client, &old).await;
        }
        tracing::debug!(id, topic = message.topic(), "pool subscription started");
        let subscription = client.subscribe_envelope(message).await;
        if subscription.is_err() {
            self.streams.lock().remove(&id);
        }
        subscription
    }

    /// Unsubscribe the envelope tracked under `id`; no-op for unknown ids.
    pub async fn stop(&self, client: &Client, id: u64) {
        let removed = self.streams.lock().remove(&id);
        if let Some(old) = removed {
            tracing::debug!(id, topic = old.topic(), "pool subscription stopped");
            Self::unsubscribe(client, &old).await;
        }
    }

    /// Unsubscribe every tracked id, awaiting completion of all, then clear
    /// the pool; used at teardown to avoid leaking server-side entries.
    pub async fn destroy(&self, client: &Client) {
        let drained: Vec<Envelope> = {
            let mut guard = self.streams.lock();
            guard.drain().map(|(_, message)| message).collect()
        };
        for message in &drained {
            Self::unsubscribe(client, message).await;
        }
        tracing::debug!(count = drained.len(), "subscription pool destroyed");
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    async fn unsubscribe(client: &Client, message: &Envelope) {
        let mut unsub = message.clone_header();
        unsub.data_mut().write_length(0);
        if let Err(err) = client.send(unsub).await {
            tracing::debug!(topic = message.topic(), error = %err, "pool unsubscribe failed");
        }
    }
}
