// Cancelable subscription streams.
use murmur_wire::{Envelope, UNLIMITED};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::Command;

/// A bounded stream of topic deliveries.
///
/// The stream completes after the subscribed count of deliveries. Dropping
/// or cancelling it sends a count-0 unsubscribe for its routing header
/// exactly once; both are idempotent and silent after the stream has ended.
pub struct Subscription {
    header: Envelope,
    // Pool subscriptions also match the correlation reference; plain topic
    // subscriptions ignore it.
    match_reference: bool,
    remaining: u32,
    done: bool,
    unsubscribed: bool,
    inbound: broadcast::Receiver<Envelope>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        header: Envelope,
        count: u32,
        match_reference: bool,
        inbound: broadcast::Receiver<Envelope>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            header,
            match_reference,
            remaining: count,
            done: count == 0,
            // A count-0 subscribe already was the unsubscribe.
            unsubscribed: count == 0,
            inbound,
            commands,
        }
    }

    pub fn topic(&self) -> &str {
        self.header.topic()
    }

    /// Next delivery, or `None` once the stream has completed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.done {
            return None;
        }
        loop {
            match self.inbound.recv().await {
                Ok(message) => {
                    let matched = if self.match_reference {
                        message.matches(&self.header)
                    } else {
                        message.matches_topic(&self.header)
                    };
                    if !matched {
                        continue;
                    }
                    if self.remaining != UNLIMITED {
                        self.remaining -= 1;
                        if self.remaining == 0 {
                            self.done = true;
                        }
                    }
                    return Some(message);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, topic = self.header.topic(), "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Stop the stream and unsubscribe; idempotent, never errors, and safe
    /// to call after the stream has already completed.
    pub async fn cancel(&mut self) {
        self.done = true;
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.commands.send(Command::Send {
            envelope: unsubscribe_message(&self.header),
            reply: Some(reply_tx),
        });
        if sent.is_err() {
            return;
        }
        // Completion failures are irrelevant once the stream is cancelled.
        let _ = reply_rx.await;
        tracing::debug!(topic = self.header.topic(), "subscription cancelled");
    }
}

fn unsubscribe_message(header: &Envelope) -> Envelope {
    let mut message = header.clone_header();
    message.data_mut().write_length(0);
    message
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        let _ = self.commands.send(Command::Send {
            envelope: unsubscribe_message(&self.header),
            reply: None,
        });
    }
}
