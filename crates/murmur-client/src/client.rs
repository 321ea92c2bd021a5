// Connection supervisor: reconnect with backoff, request/response
// correlation, and inbound fan-out.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use murmur_transport::{CLOSE_NORMAL, Socket, SocketEvent, SocketFactory};
use murmur_wire::Envelope;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::subscription::Subscription;

pub(crate) enum Command {
    Send {
        envelope: Envelope,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Reconnect,
    Disconnect,
    Close,
}

/// Resilient connection to a murmur peer.
///
/// The client starts unconnected; the first `send` (or an explicit
/// [`Client::reconnect`]) drives the connect/backoff loop. Once a connection
/// has been established, a transport loss re-enters that loop automatically
/// until [`Client::disconnect`] or [`Client::close`].
///
/// ```no_run
/// use murmur_client::{Client, ClientConfig};
/// use murmur_transport::MemorySocket;
/// use murmur_wire::Envelope;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let client = Client::new(
///     || {
///         let ((socket, events), _server) = MemorySocket::open_pair();
///         (socket as std::sync::Arc<dyn murmur_transport::Socket>, events)
///     },
///     ClientConfig::default(),
/// );
/// client.send(Envelope::new("orders")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<bool>,
    errors: broadcast::Sender<String>,
    inbound: broadcast::Sender<Envelope>,
}

impl Client {
    pub fn new(factory: impl SocketFactory + 'static, config: ClientConfig) -> Self {
        let config = config.normalized();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(false);
        let (error_tx, _) = broadcast::channel(config.inbound_queue_capacity);
        let (inbound_tx, _) = broadcast::channel(config.inbound_queue_capacity);

        let supervisor = Supervisor {
            factory: Box::new(factory),
            delay: config.min_reconnect_delay,
            config,
            commands: command_rx,
            state_tx,
            errors: error_tx.clone(),
            inbound: inbound_tx.clone(),
            socket: None,
            events: None,
            phase: Phase::Unconnected,
            auto_reconnect: true,
            attempts: 0,
            retry_at: None,
            pending: VecDeque::new(),
        };
        tokio::spawn(supervisor.run());

        Self {
            commands: command_tx,
            state_rx,
            errors: error_tx,
            inbound: inbound_tx,
        }
    }

    /// Stream of connectivity transitions (true = open).
    pub fn state(&self) -> watch::Receiver<bool> {
        self.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        *self.state_rx.borrow()
    }

    /// Stream of transport and decode errors.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Stream of every decoded inbound envelope (keepalives excluded).
    pub fn inbound(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    /// Send a message, connecting first if necessary.
    ///
    /// When the connection is down this suspends until the socket opens, or
    /// fails explicitly once the configured attempt budget is spent.
    pub async fn send(&self, message: Envelope) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                envelope: message,
                reply: Some(reply_tx),
            })
            .map_err(|_| anyhow!("client closed"))?;
        reply_rx.await.context("send reply dropped")?
    }

    /// Send a request and await exactly one response whose routing header
    /// matches (topic and reference). All other inbound traffic is ignored
    /// for this call.
    pub async fn post(&self, message: Envelope) -> Result<Envelope> {
        let header = message.clone_header();
        // Register before sending so a fast response cannot slip past.
        let mut inbound = self.inbound.subscribe();
        self.send(message).await?;
        loop {
            match inbound.recv().await {
                Ok(incoming) if incoming.matches(&header) => return Ok(incoming),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("client closed while awaiting response"));
                }
            }
        }
    }

    /// Subscribe to a topic, returning a cancelable stream of deliveries.
    ///
    /// `count` bounds the stream (`murmur_wire::UNLIMITED` = no bound);
    /// dropping or cancelling the stream unsubscribes exactly once.
    pub async fn subscribe(&self, topic: &str, count: u32) -> Result<Subscription> {
        let message = Envelope::subscribe(topic, count);
        let header = message.clone_header();
        let inbound = self.inbound.subscribe();
        self.send(message).await?;
        Ok(Subscription::new(
            header,
            count,
            false,
            inbound,
            self.commands.clone(),
        ))
    }

    /// Subscribe from a caller-built subscribe envelope; deliveries match on
    /// both topic and reference. Used by the subscription pool.
    pub async fn subscribe_envelope(&self, message: Envelope) -> Result<Subscription> {
        let mut probe = message.data().clone();
        let count = probe
            .read_length()
            .context("subscribe envelope missing count")?;
        let header = message.clone_header();
        let inbound = self.inbound.subscribe();
        self.send(message).await?;
        Ok(Subscription::new(
            header,
            count,
            true,
            inbound,
            self.commands.clone(),
        ))
    }

    /// Force a fresh connection attempt regardless of current state.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Drop the connection and suppress automatic reconnection until
    /// [`Client::reconnect`] is called.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Tear the client down; pending and future operations fail.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

enum Phase {
    Unconnected,
    Connecting,
    Open,
    Closing,
}

struct PendingSend {
    envelope: Envelope,
    reply: Option<oneshot::Sender<Result<()>>>,
    // The send fails once this many connection attempts have elapsed.
    expires_at_attempt: u64,
}

struct Supervisor {
    factory: Box<dyn SocketFactory>,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<bool>,
    errors: broadcast::Sender<String>,
    inbound: broadcast::Sender<Envelope>,
    socket: Option<Arc<dyn Socket>>,
    events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    phase: Phase,
    // Cleared by an explicit disconnect; set again by reconnect.
    auto_reconnect: bool,
    // Next backoff delay; doubles per failure, resets on open.
    delay: Duration,
    // Failed attempts since the last successful open.
    attempts: u64,
    retry_at: Option<Instant>,
    pending: VecDeque<PendingSend>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command) {
                                break;
                            }
                        }
                        // Every client handle dropped: tear down.
                        None => break,
                    }
                }
                event = recv_event(&mut self.events) => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => self.connection_lost("transport event channel closed"),
                    }
                }
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.begin_connect();
                }
            }
        }
        if let Some(socket) = self.socket.take() {
            socket.close(CLOSE_NORMAL, "client closed");
        }
        let _ = self.state_tx.send(false);
        self.fail_pending("client closed");
    }

    // Returns true when the supervisor should shut down.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { envelope, reply } => {
                if matches!(self.phase, Phase::Open) {
                    let result = self.write(&envelope);
                    if let Err(err) = &result {
                        let _ = self.errors.send(format!("send failed: {err:#}"));
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    return false;
                }
                if !self.auto_reconnect {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(anyhow!("client is disconnected")));
                    }
                    return false;
                }
                // Park the send and drive the connect loop; the parked send
                // completes on open or fails after its attempt budget.
                self.pending.push_back(PendingSend {
                    envelope,
                    reply,
                    expires_at_attempt: self.attempts + self.config.max_send_attempts,
                });
                if self.retry_at.is_none() && !matches!(self.phase, Phase::Connecting) {
                    self.begin_connect();
                }
                false
            }
            Command::Reconnect => {
                self.auto_reconnect = true;
                self.retry_at = None;
                self.drop_socket("reconnect");
                self.begin_connect();
                false
            }
            Command::Disconnect => {
                self.auto_reconnect = false;
                self.retry_at = None;
                self.drop_socket("disconnect");
                self.fail_pending("client disconnected");
                false
            }
            Command::Close => {
                self.phase = Phase::Closing;
                true
            }
        }
    }

    fn handle_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.handle_open(),
            SocketEvent::Message(frame) => self.handle_frame(frame),
            SocketEvent::Error(message) => {
                tracing::debug!(error = %message, "transport error");
                let _ = self.errors.send(message);
            }
            SocketEvent::Closed { code, reason } => {
                tracing::debug!(code, reason = %reason, "transport closed");
                self.connection_lost("transport closed");
            }
        }
    }

    fn handle_open(&mut self) {
        self.phase = Phase::Open;
        self.attempts = 0;
        self.delay = self.config.min_reconnect_delay;
        // Cancel any backoff timer still in flight.
        self.retry_at = None;
        let _ = self.state_tx.send(true);
        tracing::debug!("connected");
        self.flush_pending();
    }

    fn handle_frame(&mut self, frame: Bytes) {
        if frame.len() > self.config.max_frame_bytes {
            let _ = self.errors.send(format!(
                "frame too large: {} bytes (cap {}); dropped",
                frame.len(),
                self.config.max_frame_bytes
            ));
            metrics::counter!("murmur_client_frames_dropped_total").increment(1);
            return;
        }
        let message = match Envelope::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "inbound decode failed");
                let _ = self.errors.send(format!("decode error: {err}"));
                metrics::counter!("murmur_client_frames_dropped_total").increment(1);
                return;
            }
        };
        if message.is_keepalive() {
            tracing::debug!("keepalive received");
            return;
        }
        tracing::debug!(topic = message.topic(), "message received");
        let _ = self.inbound.send(message);
    }

    fn begin_connect(&mut self) {
        if matches!(self.phase, Phase::Connecting | Phase::Open) {
            return;
        }
        self.phase = Phase::Connecting;
        tracing::debug!("connecting");
        let (socket, events) = self.factory.connect();
        self.socket = Some(socket);
        self.events = Some(events);
    }

    fn connection_lost(&mut self, reason: &str) {
        self.socket = None;
        self.events = None;
        self.phase = Phase::Unconnected;
        let _ = self.state_tx.send(false);
        tracing::debug!(reason, "connection lost");
        if self.auto_reconnect {
            self.schedule_retry();
        } else {
            self.fail_pending("client disconnected");
        }
    }

    fn schedule_retry(&mut self) {
        self.attempts += 1;
        metrics::counter!("murmur_client_reconnects_total").increment(1);
        self.fail_expired_sends();
        self.retry_at = Some(Instant::now() + self.delay);
        tracing::debug!(
            delay_ms = self.delay.as_millis() as u64,
            attempt = self.attempts,
            "reconnect scheduled"
        );
        self.delay = (self.delay * 2).min(self.config.max_reconnect_delay);
    }

    fn fail_expired_sends(&mut self) {
        let attempts = self.attempts;
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if pending.expires_at_attempt > attempts {
                kept.push_back(pending);
                continue;
            }
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(anyhow!(
                    "connection attempts exhausted after {attempts} tries"
                )));
            }
        }
        self.pending = kept;
    }

    fn flush_pending(&mut self) {
        while let Some(pending) = self.pending.pop_front() {
            let result = self.write(&pending.envelope);
            if let Err(err) = &result {
                let _ = self.errors.send(format!("send failed: {err:#}"));
            }
            if let Some(reply) = pending.reply {
                let _ = reply.send(result);
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(anyhow!("{reason}")));
            }
        }
    }

    fn drop_socket(&mut self, reason: &str) {
        if let Some(socket) = self.socket.take() {
            socket.close(CLOSE_NORMAL, reason);
        }
        self.events = None;
        self.phase = Phase::Unconnected;
        let _ = self.state_tx.send(false);
    }

    fn write(&self, message: &Envelope) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow!("socket missing"))?;
        let frame = message.encode().context("encode message")?;
        socket.send(frame).context("write frame")?;
        tracing::debug!(topic = message.topic(), "message sent");
        Ok(())
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<SocketEvent>>) -> Option<SocketEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
