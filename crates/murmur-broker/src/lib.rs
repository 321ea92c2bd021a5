// Subscription registry and publication engine.
// Tracks, per connection, how many more deliveries of a topic are wanted,
// and expires entries as counts run out or sends fail.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use murmur_transport::{CLOSE_INTERNAL_ERROR, ConnectionId, Socket, SocketState};
use murmur_wire::{Envelope, UNLIMITED};
use parking_lot::Mutex;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
    #[error("malformed subscribe payload")]
    MalformedSubscribe(#[from] murmur_wire::Error),
}

// Per-connection attributes live here, keyed by identity, never on the
// transport object itself.
#[derive(Debug)]
struct ConnectionEntry {
    socket: Arc<dyn Socket>,
    token: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    // topic -> connection -> remaining delivery count (UNLIMITED = no cap).
    // Invariant: no topic maps to an empty map, and a connection appears at
    // most once per topic.
    topics: HashMap<String, HashMap<ConnectionId, u32, RandomState>, RandomState>,
    connections: HashMap<ConnectionId, ConnectionEntry, RandomState>,
}

/// Topic subscription registry driving publish, subscribe and keepalive.
///
/// All state sits behind one mutex, so the registry can be driven from any
/// task; subscribe, publish and unsubscribe interleave on the same maps.
///
/// ```
/// use murmur_broker::Registry;
/// use murmur_transport::MemorySocket;
/// use murmur_wire::Envelope;
///
/// let registry = Registry::new();
/// let ((server, _events), _client) = MemorySocket::open_pair();
/// let conn = registry.register_connection(server);
/// registry.subscribe(conn, "orders", 1).expect("subscribe");
/// let delivered = registry.publish(&Envelope::new("orders"));
/// assert_eq!(delivered, 1);
/// ```
#[derive(Debug)]
pub struct Registry {
    state: Mutex<RegistryState>,
    next_connection_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Admit a transport endpoint and hand back its stable identity.
    pub fn register_connection(&self, socket: Arc<dyn Socket>) -> ConnectionId {
        let conn = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().connections.insert(
            conn,
            ConnectionEntry {
                socket,
                token: None,
                address: None,
            },
        );
        conn
    }

    /// Drop a connection and every subscription it holds; invoked on close.
    pub fn remove_connection(&self, conn: ConnectionId) {
        self.unsubscribe_all(conn);
        self.state.lock().connections.remove(&conn);
    }

    pub fn set_connection_token(&self, conn: ConnectionId, token: impl Into<String>) {
        if let Some(entry) = self.state.lock().connections.get_mut(&conn) {
            entry.token = Some(token.into());
        }
    }

    pub fn connection_token(&self, conn: ConnectionId) -> Option<String> {
        self.state.lock().connections.get(&conn)?.token.clone()
    }

    pub fn set_connection_address(&self, conn: ConnectionId, address: impl Into<String>) {
        if let Some(entry) = self.state.lock().connections.get_mut(&conn) {
            entry.address = Some(address.into());
        }
    }

    pub fn connection_address(&self, conn: ConnectionId) -> Option<String> {
        self.state.lock().connections.get(&conn)?.address.clone()
    }

    /// Subscribe or unsubscribe a connection.
    ///
    /// A count of 0 removes the connection from the topic (idempotent, no
    /// error if absent). A positive count inserts or overwrites the
    /// remaining count; the last call wins, counts are never summed.
    /// Returns the accepted count.
    pub fn subscribe(&self, conn: ConnectionId, topic: &str, count: u32) -> Result<u32> {
        let mut guard = self.state.lock();
        if count == 0 {
            if let Some(conns) = guard.topics.get_mut(topic) {
                conns.remove(&conn);
                if conns.is_empty() {
                    guard.topics.remove(topic);
                }
            }
            tracing::debug!(topic, ?conn, "connection unsubscribed");
            return Ok(0);
        }
        if !guard.connections.contains_key(&conn) {
            return Err(RegistryError::UnknownConnection(conn));
        }
        guard
            .topics
            .entry_ref(topic)
            .or_default()
            .insert(conn, count);
        tracing::debug!(topic, ?conn, count, "connection subscribed");
        Ok(count)
    }

    /// Server-side entry point for an inbound subscribe control frame: the
    /// payload carries the requested count.
    pub fn handle_subscribe(&self, conn: ConnectionId, message: &Envelope) -> Result<u32> {
        let mut payload = message.data().clone();
        let count = payload.read_length()?;
        self.subscribe(conn, message.topic(), count)
    }

    /// Remove the connection from every topic; returns how many entries
    /// were dropped.
    pub fn unsubscribe_all(&self, conn: ConnectionId) -> usize {
        let mut removed = 0;
        let mut guard = self.state.lock();
        guard.topics.retain(|_, conns| {
            if conns.remove(&conn).is_some() {
                removed += 1;
            }
            !conns.is_empty()
        });
        tracing::debug!(?conn, removed, "connection unsubscribed from all topics");
        removed
    }

    /// Deliver a message to every connection subscribed to its topic.
    ///
    /// Each successful send decrements the remaining count (unlimited never
    /// decrements) and removes the entry at zero; a failed send removes the
    /// entry immediately with no retry. Returns the delivery count.
    pub fn publish(&self, message: &Envelope) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(topic = message.topic(), error = %err, "publish encode failed");
                return 0;
            }
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(conns) = state.topics.get_mut(message.topic()) else {
            return 0;
        };
        let mut delivered = 0;
        let mut finished = Vec::new();
        for (conn, remaining) in conns.iter_mut() {
            let sent = state
                .connections
                .get(conn)
                .is_some_and(|entry| send_frame(entry, frame.clone(), message.topic()));
            if sent {
                delivered += 1;
                if *remaining != UNLIMITED {
                    *remaining -= 1;
                    if *remaining == 0 {
                        finished.push(*conn);
                    }
                }
            } else {
                finished.push(*conn);
            }
        }
        for conn in finished {
            conns.remove(&conn);
        }
        if conns.is_empty() {
            state.topics.remove(message.topic());
        }
        metrics::counter!("murmur_publish_delivered_total").increment(delivered as u64);
        tracing::debug!(topic = message.topic(), delivered, "message published");
        delivered
    }

    /// Send a keepalive frame to one connection, or to every distinct
    /// connection across all topics (each touched at most once). Failures
    /// are handled exactly as in [`Registry::publish`]. Returns the number
    /// of connections pinged.
    pub fn ping(&self, conn: Option<ConnectionId>) -> usize {
        let frame = match Envelope::keepalive().encode() {
            Ok(frame) => frame,
            Err(_) => return 0,
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(conn) = conn {
            let sent = state
                .connections
                .get(&conn)
                .is_some_and(|entry| send_frame(entry, frame, ""));
            if !sent {
                state.topics.retain(|_, conns| {
                    conns.remove(&conn);
                    !conns.is_empty()
                });
            }
            return usize::from(sent);
        }
        let mut sent = HashSet::new();
        let mut failed = HashSet::new();
        state.topics.retain(|topic, conns| {
            conns.retain(|conn, _| {
                if sent.contains(conn) {
                    return true;
                }
                if failed.contains(conn) {
                    return false;
                }
                let ok = state
                    .connections
                    .get(conn)
                    .is_some_and(|entry| send_frame(entry, frame.clone(), topic));
                if ok {
                    sent.insert(*conn);
                } else {
                    failed.insert(*conn);
                }
                ok
            });
            !conns.is_empty()
        });
        metrics::counter!("murmur_ping_sent_total").increment(sent.len() as u64);
        sent.len()
    }

    /// Send a message to one connection, returning whether the write
    /// succeeded.
    pub fn send(&self, conn: ConnectionId, message: &Envelope) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(topic = message.topic(), error = %err, "send encode failed");
                return false;
            }
        };
        let guard = self.state.lock();
        guard
            .connections
            .get(&conn)
            .is_some_and(|entry| send_frame(entry, frame, message.topic()))
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, HashMap::len)
    }

    /// Remaining delivery count for one (connection, topic) entry.
    pub fn subscription(&self, conn: ConnectionId, topic: &str) -> Option<u32> {
        self.state.lock().topics.get(topic)?.get(&conn).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

// The single choke point for transport writes. Never propagates an error:
// any failure closes the connection with an internal-error code and reports
// the outcome through the return value.
fn send_frame(entry: &ConnectionEntry, frame: bytes::Bytes, topic: &str) -> bool {
    if entry.socket.state() != SocketState::Open {
        tracing::warn!(topic, state = ?entry.socket.state(), "send skipped: socket not open");
        metrics::counter!("murmur_send_failed_total").increment(1);
        entry.socket.close(CLOSE_INTERNAL_ERROR, "send failed");
        return false;
    }
    match entry.socket.send(frame) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(topic, error = %err, "send failed");
            metrics::counter!("murmur_send_failed_total").increment(1);
            entry.socket.close(CLOSE_INTERNAL_ERROR, "send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use murmur_transport::{MemorySocket, SocketEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Peer {
        registry_conn: ConnectionId,
        socket: Arc<MemorySocket>,
        events: UnboundedReceiver<SocketEvent>,
        server_events: UnboundedReceiver<SocketEvent>,
    }

    fn peer(registry: &Registry) -> Peer {
        let ((server, server_events), (client, events)) = MemorySocket::open_pair();
        let registry_conn = registry.register_connection(server);
        Peer {
            registry_conn,
            socket: client,
            events,
            server_events,
        }
    }

    fn received_frames(events: &mut UnboundedReceiver<SocketEvent>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SocketEvent::Message(frame) = event {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn subscribe_overwrites_instead_of_summing() {
        let registry = Registry::new();
        let peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", 3)
            .expect("subscribe");
        registry
            .subscribe(peer.registry_conn, "orders", 5)
            .expect("subscribe");
        assert_eq!(registry.subscription(peer.registry_conn, "orders"), Some(5));
        assert_eq!(registry.subscriber_count("orders"), 1);
    }

    #[test]
    fn zero_count_unsubscribes_idempotently() {
        let registry = Registry::new();
        let peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", 2)
            .expect("subscribe");
        assert_eq!(
            registry
                .subscribe(peer.registry_conn, "orders", 0)
                .expect("unsubscribe"),
            0
        );
        // Unsubscribing again, or from a topic never subscribed, is a no-op.
        registry
            .subscribe(peer.registry_conn, "orders", 0)
            .expect("unsubscribe");
        registry
            .subscribe(peer.registry_conn, "missing", 0)
            .expect("unsubscribe");
        assert!(!registry.has_topic("orders"));
    }

    #[test]
    fn subscribe_rejects_unknown_connections() {
        let registry = Registry::new();
        let err = registry
            .subscribe(ConnectionId(404), "orders", 1)
            .expect_err("unknown");
        assert!(matches!(err, RegistryError::UnknownConnection(_)));
    }

    #[test]
    fn no_topic_ever_maps_to_an_empty_subscriber_set() {
        let registry = Registry::new();
        let first = peer(&registry);
        let second = peer(&registry);
        registry
            .subscribe(first.registry_conn, "orders", 1)
            .expect("subscribe");
        registry
            .subscribe(second.registry_conn, "orders", 1)
            .expect("subscribe");
        registry
            .subscribe(first.registry_conn, "orders", 0)
            .expect("unsubscribe");
        assert!(registry.has_topic("orders"));
        registry
            .subscribe(second.registry_conn, "orders", 0)
            .expect("unsubscribe");
        assert!(!registry.has_topic("orders"));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn publish_decrements_and_expires_at_zero() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", 3)
            .expect("subscribe");

        let message = Envelope::new("orders");
        assert_eq!(registry.publish(&message), 1);
        assert_eq!(registry.subscription(peer.registry_conn, "orders"), Some(2));
        assert_eq!(registry.publish(&message), 1);
        assert_eq!(registry.publish(&message), 1);
        // The third delivery expired the entry; a fourth publish reaches
        // nobody and the topic itself is gone.
        assert_eq!(registry.publish(&message), 0);
        assert!(!registry.has_topic("orders"));
        assert_eq!(received_frames(&mut peer.events).len(), 3);
    }

    #[test]
    fn unlimited_subscriptions_never_expire() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", UNLIMITED)
            .expect("subscribe");
        let message = Envelope::new("orders");
        for _ in 0..10 {
            assert_eq!(registry.publish(&message), 1);
        }
        assert_eq!(
            registry.subscription(peer.registry_conn, "orders"),
            Some(UNLIMITED)
        );
        assert_eq!(received_frames(&mut peer.events).len(), 10);
    }

    #[test]
    fn publish_reaches_every_subscriber_and_reports_count() {
        let registry = Registry::new();
        let mut first = peer(&registry);
        let mut second = peer(&registry);
        registry
            .subscribe(first.registry_conn, "orders", UNLIMITED)
            .expect("subscribe");
        registry
            .subscribe(second.registry_conn, "orders", UNLIMITED)
            .expect("subscribe");

        let mut message = Envelope::new("orders");
        message.data_mut().write_string("payload").expect("write");
        assert_eq!(registry.publish(&message), 2);
        assert_eq!(registry.publish(&Envelope::new("unrelated")), 0);

        for peer in [&mut first, &mut second] {
            let frames = received_frames(&mut peer.events);
            assert_eq!(frames.len(), 1);
            let mut decoded = Envelope::decode(frames[0].clone()).expect("decode");
            assert_eq!(decoded.topic(), "orders");
            assert_eq!(decoded.data_mut().read_string().expect("read"), "payload");
        }
    }

    #[test]
    fn failed_send_removes_the_connection_and_closes_it() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", UNLIMITED)
            .expect("subscribe");
        // Dropping the client-side receiver makes every write fail while the
        // socket still reports open.
        drop(peer.events);

        assert_eq!(registry.publish(&Envelope::new("orders")), 0);
        assert!(!registry.has_topic("orders"));

        // The registry scheduled a close with the internal error code.
        let closes: Vec<_> = received_frames_and_closes(&mut peer.server_events);
        assert!(
            closes
                .iter()
                .any(|code| *code == murmur_transport::CLOSE_INTERNAL_ERROR)
        );
        assert_eq!(peer.socket.state(), SocketState::Closed);
    }

    fn received_frames_and_closes(events: &mut UnboundedReceiver<SocketEvent>) -> Vec<u16> {
        let mut codes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SocketEvent::Closed { code, .. } = event {
                codes.push(code);
            }
        }
        codes
    }

    #[test]
    fn unsubscribe_all_sweeps_every_topic() {
        let registry = Registry::new();
        let peer = peer(&registry);
        let other = peer_with_topics(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", 1)
            .expect("subscribe");
        registry
            .subscribe(peer.registry_conn, "quotes", UNLIMITED)
            .expect("subscribe");

        assert_eq!(registry.unsubscribe_all(peer.registry_conn), 2);
        assert!(!registry.has_topic("orders"));
        // The other connection keeps its own subscription.
        assert!(registry.has_topic("shared"));
        let _ = other;
    }

    fn peer_with_topics(registry: &Registry) -> Peer {
        let peer = peer(registry);
        registry
            .subscribe(peer.registry_conn, "shared", UNLIMITED)
            .expect("subscribe");
        peer
    }

    #[test]
    fn ping_touches_each_connection_once() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        registry
            .subscribe(peer.registry_conn, "orders", 1)
            .expect("subscribe");
        registry
            .subscribe(peer.registry_conn, "quotes", 1)
            .expect("subscribe");

        assert_eq!(registry.ping(None), 1);
        let frames = received_frames(&mut peer.events);
        assert_eq!(frames.len(), 1);
        let decoded = Envelope::decode(frames[0].clone()).expect("decode");
        assert!(decoded.is_keepalive());
        // Counts are untouched by keepalives.
        assert_eq!(registry.subscription(peer.registry_conn, "orders"), Some(1));
    }

    #[test]
    fn ping_failure_expires_the_connection_everywhere() {
        let registry = Registry::new();
        let dead = peer(&registry);
        let mut live = peer(&registry);
        registry
            .subscribe(dead.registry_conn, "orders", 1)
            .expect("subscribe");
        registry
            .subscribe(dead.registry_conn, "quotes", 1)
            .expect("subscribe");
        registry
            .subscribe(live.registry_conn, "orders", 1)
            .expect("subscribe");
        dead.socket.close(murmur_transport::CLOSE_NORMAL, "gone");

        assert_eq!(registry.ping(None), 1);
        assert_eq!(registry.subscriber_count("orders"), 1);
        assert!(!registry.has_topic("quotes"));
        assert_eq!(received_frames(&mut live.events).len(), 1);
    }

    #[test]
    fn ping_single_connection() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        assert_eq!(registry.ping(Some(peer.registry_conn)), 1);
        assert_eq!(registry.ping(Some(ConnectionId(404))), 0);
        assert_eq!(received_frames(&mut peer.events).len(), 1);
    }

    #[test]
    fn handle_subscribe_reads_the_count_from_the_payload() {
        let registry = Registry::new();
        let peer = peer(&registry);
        let message = Envelope::subscribe("orders", 7);
        assert_eq!(
            registry
                .handle_subscribe(peer.registry_conn, &message)
                .expect("subscribe"),
            7
        );
        assert_eq!(registry.subscription(peer.registry_conn, "orders"), Some(7));

        let unsubscribe = Envelope::subscribe("orders", 0);
        registry
            .handle_subscribe(peer.registry_conn, &unsubscribe)
            .expect("unsubscribe");
        assert!(!registry.has_topic("orders"));
    }

    #[test]
    fn handle_subscribe_rejects_malformed_payloads() {
        let registry = Registry::new();
        let peer = peer(&registry);
        let message = Envelope::new("orders");
        let err = registry
            .handle_subscribe(peer.registry_conn, &message)
            .expect_err("malformed");
        assert!(matches!(err, RegistryError::MalformedSubscribe(_)));
    }

    #[test]
    fn remove_connection_clears_side_table_and_topics() {
        let registry = Registry::new();
        let peer = peer(&registry);
        registry.set_connection_token(peer.registry_conn, "token-1");
        registry.set_connection_address(peer.registry_conn, "10.0.0.1:9000");
        registry
            .subscribe(peer.registry_conn, "orders", 1)
            .expect("subscribe");

        assert_eq!(
            registry.connection_token(peer.registry_conn).as_deref(),
            Some("token-1")
        );
        assert_eq!(
            registry.connection_address(peer.registry_conn).as_deref(),
            Some("10.0.0.1:9000")
        );

        registry.remove_connection(peer.registry_conn);
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.has_topic("orders"));
        assert!(registry.connection_token(peer.registry_conn).is_none());
    }

    #[test]
    fn direct_send_round_trips_an_envelope() {
        let registry = Registry::new();
        let mut peer = peer(&registry);
        let mut message = Envelope::with_reference("quotes", 42);
        message.data_mut().write_u32(7);
        assert!(registry.send(peer.registry_conn, &message));

        let frames = received_frames(&mut peer.events);
        let mut decoded = Envelope::decode(frames[0].clone()).expect("decode");
        assert_eq!(decoded.reference(), 42);
        assert_eq!(decoded.data_mut().read_u32().expect("read"), 7);
        assert!(!registry.send(ConnectionId(404), &message));
    }
}
