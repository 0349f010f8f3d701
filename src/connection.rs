//! Relay connection
//!
//! A connection is one peer's live WebSocket: its identity, a bounded
//! outbound queue, and the set of connections subscribed to it.
//!
//! Each connection runs two pumps. The read pump receives frames from the
//! peer and pushes them onto the connection's own queue. The write pump is
//! the only consumer of that queue and the only writer of the socket: it
//! relays published messages into every subscriber's queue, then writes to
//! its own peer. No task ever writes to another connection's socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::hub::HubHandle;
use crate::transport::{Frame, FrameSink, FrameSource, TransportError};

/// Default outbound queue capacity per connection
pub const DEFAULT_QUEUE_CAPACITY: usize = 512;

/// Default maximum inbound frame size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Default idle-read deadline, refreshed by every pong
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default deadline for a single socket write
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Item on a connection's outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text the connection's own peer sent. Relayed to subscribers, then
    /// echoed back to the peer.
    Published(String),
    /// Encoded envelope for this connection's peer only
    Deliver(Arc<str>),
}

/// Pump deadlines and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Idle-read deadline
    pub pong_wait: Duration,
    /// Heartbeat period, must be shorter than `pong_wait`
    pub ping_period: Duration,
    /// Per-write deadline
    pub write_wait: Duration,
    /// Largest accepted inbound frame
    pub max_message_size: usize,
}

impl Timing {
    /// Timing with the heartbeat at 9/10 of the idle deadline
    pub fn new(pong_wait: Duration, write_wait: Duration, max_message_size: usize) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait,
            max_message_size,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new(DEFAULT_PONG_WAIT, DEFAULT_WRITE_WAIT, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Outcome of one relay pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

/// One peer's connection
pub struct Connection {
    identity: String,
    /// `None` once the hub has closed the queue
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Subscribers: identity -> connection
    subscribers: DashMap<String, Weak<Connection>>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    ///
    /// The receiver belongs to the write pump and nothing else.
    pub fn new(
        identity: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            identity: identity.into(),
            outbound: Mutex::new(Some(tx)),
            subscribers: DashMap::new(),
            dropped_messages: AtomicU64::new(0),
        });
        (connection, rx)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Deliveries refused because the queue was full or closed
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Enqueue without waiting. Used by every producer other than the
    /// connection's own read pump.
    pub fn try_enqueue(&self, item: Outbound) -> Result<(), EnqueueError> {
        let result = match self.outbound.lock().as_ref() {
            Some(tx) => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => EnqueueError::Full,
                TrySendError::Closed(_) => EnqueueError::Closed,
            }),
            None => Err(EnqueueError::Closed),
        };

        if result.is_err() {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Enqueue, waiting for room if the queue is full.
    pub async fn enqueue(&self, item: Outbound) -> Result<(), EnqueueError> {
        let tx = self.outbound.lock().clone().ok_or(EnqueueError::Closed)?;
        tx.send(item).await.map_err(|_| EnqueueError::Closed)
    }

    /// Close the outbound queue. The write pump drains what is left, sends a
    /// close frame and stops. Returns `false` if it was already closed.
    pub(crate) fn close_outbound(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Add `subscriber` to this connection's subscriber set.
    ///
    /// Returns `false` when nothing changed: already subscribed, or a
    /// connection subscribing to itself (its own messages are echoed anyway).
    pub fn add_subscriber(&self, subscriber: &Arc<Connection>) -> bool {
        if std::ptr::eq(self, Arc::as_ptr(subscriber)) {
            return false;
        }

        let weak = Arc::downgrade(subscriber);
        let mut entry = self
            .subscribers
            .entry(subscriber.identity.clone())
            .or_insert_with(Weak::new);
        if Weak::ptr_eq(entry.value(), &weak) {
            return false;
        }
        *entry.value_mut() = weak;
        true
    }

    pub fn is_subscribed(&self, identity: &str) -> bool {
        self.subscribers
            .get(identity)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `payload` to every current subscriber as a `broadcast`
    /// envelope, through each subscriber's own queue.
    pub fn relay(&self, payload: &str) -> RelayReport {
        match Envelope::broadcast(payload).encode() {
            Ok(encoded) => self.relay_encoded(&Arc::from(encoded)),
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "failed to encode broadcast");
                RelayReport::default()
            }
        }
    }

    fn relay_encoded(&self, encoded: &Arc<str>) -> RelayReport {
        let snapshot: Vec<(String, Weak<Connection>)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut report = RelayReport::default();
        for (identity, weak) in snapshot {
            let Some(subscriber) = weak.upgrade() else {
                self.prune_subscriber(&identity, &weak);
                debug!(publisher = %self.identity, subscriber = %identity, "subscriber gone");
                report.failed += 1;
                continue;
            };

            match subscriber.try_enqueue(Outbound::Deliver(encoded.clone())) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    if e == EnqueueError::Closed {
                        self.prune_subscriber(&identity, &weak);
                    }
                    warn!(
                        publisher = %self.identity,
                        subscriber = %identity,
                        error = %e,
                        "failed to relay message"
                    );
                    report.failed += 1;
                }
            }
        }

        debug!(
            publisher = %self.identity,
            delivered = report.delivered,
            failed = report.failed,
            "relay complete"
        );
        report
    }

    /// Drop a subscriber entry unless it has been replaced meanwhile
    fn prune_subscriber(&self, identity: &str, weak: &Weak<Connection>) {
        self.subscribers.remove_if(identity, |_, current| Weak::ptr_eq(current, weak));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscribers.len())
            .field("dropped", &self.drop_count())
            .finish()
    }
}

/// Outbound queue errors. Both mean the message is dropped; neither is
/// fatal to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// Collapse embedded newlines and trim surrounding whitespace
pub fn normalize(text: &str) -> String {
    text.replace('\n', " ").trim().to_owned()
}

/// Drive a registered connection until both pumps have stopped.
///
/// The write pump runs on its own task. When it stops it cancels the read
/// pump; when the read pump stops it unregisters the connection, which
/// closes the queue and lets the write pump finish.
pub async fn run<R, W>(
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<Outbound>,
    source: R,
    sink: W,
    hub: HubHandle,
    timing: Timing,
) where
    R: FrameSource + 'static,
    W: FrameSink + 'static,
{
    let cancel = CancellationToken::new();

    let writer = tokio::spawn({
        let connection = connection.clone();
        let cancel = cancel.clone();
        async move {
            let result = write_pump(connection, outbound, sink, timing).await;
            cancel.cancel();
            result
        }
    });

    let _ = read_pump(&connection, source, &hub, timing, cancel).await;

    match writer.await {
        Ok(Ok(())) => debug!(identity = %connection.identity(), "write pump finished"),
        Ok(Err(e)) => {
            debug!(identity = %connection.identity(), error = %e, "write pump stopped")
        }
        Err(e) => warn!(identity = %connection.identity(), error = %e, "write pump panicked"),
    }

    info!(
        identity = %connection.identity(),
        dropped = connection.drop_count(),
        "connection closed"
    );
}

/// Receive frames until the peer goes away, then unregister.
pub async fn read_pump<R: FrameSource>(
    connection: &Arc<Connection>,
    mut source: R,
    hub: &HubHandle,
    timing: Timing,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let result = read_frames(connection, &mut source, timing, &cancel).await;
    match &result {
        Ok(()) => debug!(identity = %connection.identity(), "read pump finished"),
        Err(e) => warn!(identity = %connection.identity(), error = %e, "read failed"),
    }

    if let Err(e) = hub.unregister(connection.clone()).await {
        warn!(identity = %connection.identity(), error = %e, "failed to unregister");
    }
    drop(source);
    result
}

async fn read_frames<R: FrameSource>(
    connection: &Connection,
    source: &mut R,
    timing: Timing,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let mut deadline = Instant::now() + timing.pong_wait;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = tokio::time::timeout_at(deadline, source.next_frame()) => next,
        };

        let frame = match next {
            Err(_) => return Err(TransportError::ReadTimeout(timing.pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        match frame {
            Frame::Text(text) => {
                if text.len() > timing.max_message_size {
                    return Err(TransportError::FrameTooLarge {
                        size: text.len(),
                        limit: timing.max_message_size,
                    });
                }

                let message = normalize(&text);
                debug!(identity = %connection.identity(), text = %message, "message received");
                if let Err(e) = connection.enqueue(Outbound::Published(message)).await {
                    debug!(
                        identity = %connection.identity(),
                        error = %e,
                        "dropping inbound message"
                    );
                    return Ok(());
                }
            }
            Frame::Pong => deadline = Instant::now() + timing.pong_wait,
            Frame::Ping => {}
            Frame::Close => return Ok(()),
        }
    }
}

/// Drain the outbound queue onto the socket, with a heartbeat ping every
/// `ping_period`.
pub async fn write_pump<W: FrameSink>(
    connection: Arc<Connection>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut sink: W,
    timing: Timing,
) -> Result<(), TransportError> {
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + timing.ping_period, timing.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Published(message)) => {
                    let encoded: Arc<str> = match Envelope::broadcast(message).encode() {
                        Ok(encoded) => encoded.into(),
                        Err(e) => {
                            warn!(
                                identity = %connection.identity(),
                                error = %e,
                                "failed to encode broadcast"
                            );
                            continue;
                        }
                    };
                    connection.relay_encoded(&encoded);
                    let frame = Frame::Text(encoded.to_string());
                    write_frame(&mut sink, frame, timing.write_wait).await?;
                }
                Some(Outbound::Deliver(encoded)) => {
                    let frame = Frame::Text(encoded.to_string());
                    write_frame(&mut sink, frame, timing.write_wait).await?;
                }
                None => {
                    debug!(identity = %connection.identity(), "outbound queue closed");
                    return write_frame(&mut sink, Frame::Close, timing.write_wait).await;
                }
            },
            _ = heartbeat.tick() => {
                write_frame(&mut sink, Frame::Ping, timing.write_wait).await?;
            }
        }
    }
}

async fn write_frame<W: FrameSink>(
    sink: &mut W,
    frame: Frame,
    deadline: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(deadline, sink.send_frame(frame))
        .await
        .map_err(|_| TransportError::WriteTimeout(deadline))?
}
