// Transport seam: the socket capability consumed by the broker and client,
// plus an in-memory implementation for tests and in-process embedding.
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("socket is not open")]
    NotOpen,
    #[error("socket closed")]
    Closed,
}

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when a write fails or the peer misbehaves.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle and traffic notifications delivered on a socket's event channel.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open,
    Message(Bytes),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Capability interface over a duplex byte-stream endpoint.
///
/// Implementations must be non-blocking: `send` either hands the frame to
/// the transport or fails immediately, and `close` is idempotent.
pub trait Socket: Send + Sync + fmt::Debug {
    fn state(&self) -> SocketState;

    fn send(&self, frame: Bytes) -> Result<()>;

    fn close(&self, code: u16, reason: &str);
}

/// Produces a fresh socket per (re)connection attempt.
///
/// Connecting is non-blocking; success or failure arrives as the first
/// event on the returned channel (`Open`, or `Closed` when refused).
pub trait SocketFactory: Send + Sync {
    fn connect(&self) -> (Arc<dyn Socket>, mpsc::UnboundedReceiver<SocketEvent>);
}

impl<F> SocketFactory for F
where
    F: Fn() -> (Arc<dyn Socket>, mpsc::UnboundedReceiver<SocketEvent>) + Send + Sync,
{
    fn connect(&self) -> (Arc<dyn Socket>, mpsc::UnboundedReceiver<SocketEvent>) {
        self()
    }
}

/// Stable identity for a transport endpoint, used as the key for all
/// per-connection bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

// Pair-wide state shared by both halves of an in-memory socket.
#[derive(Debug)]
struct PairShared {
    state: Mutex<SocketState>,
    left_events: mpsc::UnboundedSender<SocketEvent>,
    right_events: mpsc::UnboundedSender<SocketEvent>,
}

impl PairShared {
    fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SocketState::Closing | SocketState::Closed) {
                return;
            }
            *state = SocketState::Closed;
        }
        let event = SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        };
        let _ = self.left_events.send(event.clone());
        let _ = self.right_events.send(event);
    }
}

/// One half of an in-memory duplex socket pair.
///
/// Frames sent on one half arrive as `SocketEvent::Message` on the peer
/// half's event channel. Both halves share one connection state; closing
/// either half delivers a single `Closed` event to each side.
///
/// ```
/// use bytes::Bytes;
/// use murmur_transport::{MemorySocket, Socket, SocketEvent, SocketState};
///
/// let ((client, _client_events), (server, mut server_events)) = MemorySocket::open_pair();
/// assert_eq!(client.state(), SocketState::Open);
/// client.send(Bytes::from_static(b"hello")).expect("send");
/// assert!(matches!(server_events.try_recv().expect("event"), SocketEvent::Open));
/// match server_events.try_recv().expect("event") {
///     SocketEvent::Message(frame) => assert_eq!(frame, Bytes::from_static(b"hello")),
///     other => panic!("unexpected event: {other:?}"),
/// }
/// # let _ = server;
/// ```
#[derive(Debug)]
pub struct MemorySocket {
    shared: Arc<PairShared>,
    // Frames we send become Message events on the peer's channel.
    peer_events: mpsc::UnboundedSender<SocketEvent>,
}

pub type MemoryEnd = (Arc<MemorySocket>, mpsc::UnboundedReceiver<SocketEvent>);

impl MemorySocket {
    /// New pair in the `Connecting` state; call [`MemorySocket::open`] to
    /// complete the handshake or [`Socket::close`] to refuse it.
    pub fn pair() -> (MemoryEnd, MemoryEnd) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PairShared {
            state: Mutex::new(SocketState::Connecting),
            left_events: left_tx.clone(),
            right_events: right_tx.clone(),
        });
        let left = Arc::new(MemorySocket {
            shared: Arc::clone(&shared),
            peer_events: right_tx,
        });
        let right = Arc::new(MemorySocket {
            shared,
            peer_events: left_tx,
        });
        ((left, left_rx), (right, right_rx))
    }

    /// New pair that is already open, with `Open` delivered to both halves.
    pub fn open_pair() -> (MemoryEnd, MemoryEnd) {
        let (left, right) = Self::pair();
        left.0.open();
        (left, right)
    }

    /// Complete the connection handshake; both halves observe `Open`.
    pub fn open(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state != SocketState::Connecting {
                return;
            }
            *state = SocketState::Open;
        }
        let _ = self.shared.left_events.send(SocketEvent::Open);
        let _ = self.shared.right_events.send(SocketEvent::Open);
    }
}

impl Socket for MemorySocket {
    fn state(&self) -> SocketState {
        *self.shared.state.lock()
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if self.state() != SocketState::Open {
            return Err(TransportError::NotOpen);
        }
        self.peer_events
            .send(SocketEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        self.shared.close(code, reason);
    }
}
