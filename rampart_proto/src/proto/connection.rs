//! The per-connection request table and its event loop.
//!
//! Every request accepted from the channel is inserted into the table and
//! handed to the processor on its own task. Terminal outcomes (reply,
//! error, cancel, timeout) are delivered from arbitrary tasks as events on
//! an unbounded queue; only the connection's event loop applies them, so
//! frame forwarding and table removal are always observed in a single
//! order no matter which thread produced the outcome.

use atomic::Atomic;
use bytemuck::NoUninit;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use rampart_wire::SocketAddress;

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, ERROR_KIND_HEADER, LOAD_HEADER};
use crate::error::NetworkError;
use crate::proto::channel::{
    FrameErrorKind, HeaderMap, OutboundFrame, OutboundFrameSender, RawRequest, RequestId,
};
use crate::proto::duplex::ClientRequestTracker;
use crate::proto::expiry::TimerWheel;
use crate::proto::request::TrackedRequest;

#[derive(Debug, Copy, Clone, Eq, PartialEq, NoUninit)]
#[repr(u8)]
pub enum ChannelState {
    /// Accepting new requests
    Open,
    /// `stop` was requested; existing requests run to completion, new ones
    /// are rejected
    Draining,
    /// Torn down; no frames leave the connection
    Closed,
}

/// Application-side request handler. Runs on its own task per request.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, request: TrackedRequest);
}

pub(crate) enum ConnectionEvent {
    /// A request reached a terminal state; `frame` goes out on the channel
    /// unless the connection already closed
    Completed {
        id: RequestId,
        frame: Option<OutboundFrame>,
    },
    Halt,
}

pub struct ConnectionConfig {
    pub request_timeout: Duration,
    /// Signalled once per connection when it becomes reclaimable
    pub reclaim: Option<UnboundedSender<()>>,
    /// Notified on close so client-side requests sharing a duplex channel
    /// can be failed as well
    pub client_tracker: Option<Arc<dyn ClientRequestTracker>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reclaim: None,
            client_tracker: None,
        }
    }
}

/// Shared handle to one connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    peer_addr: SocketAddress,
    state: Atomic<ChannelState>,
    active: Mutex<HashMap<RequestId, TrackedRequest>>,
    to_channel: OutboundFrameSender,
    timer: Arc<dyn TimerWheel>,
    processor: Arc<dyn Processor>,
    request_timeout: Duration,
    reclaim: Option<UnboundedSender<()>>,
    client_tracker: Option<Arc<dyn ClientRequestTracker>>,
    events_tx: UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
}

impl Connection {
    /// Creates the connection and its event loop. The loop must be spawned
    /// for any outcome to reach the channel.
    pub fn new(
        peer_addr: SocketAddress,
        to_channel: OutboundFrameSender,
        timer: Arc<dyn TimerWheel>,
        processor: Arc<dyn Processor>,
        config: ConnectionConfig,
    ) -> (Self, ConnectionEventLoop) {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let this = Self {
            inner: Arc::new(ConnectionInner {
                peer_addr,
                state: Atomic::new(ChannelState::Open),
                active: Mutex::new(HashMap::new()),
                to_channel,
                timer,
                processor,
                request_timeout: config.request_timeout,
                reclaim: config.reclaim,
                client_tracker: config.client_tracker,
                events_tx,
                next_id: AtomicU64::new(1),
            }),
        };
        let event_loop = ConnectionEventLoop {
            conn: this.clone(),
            rx: events_rx,
        };

        (this, event_loop)
    }

    pub fn peer_addr(&self) -> &SocketAddress {
        &self.inner.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.load(Ordering::SeqCst)
    }

    /// Count of requests that have not yet reached a terminal state
    pub fn pending(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Accepts one request off the channel: tracks it, arms its deadline,
    /// and hands it to the processor on a fresh task. Requests arriving
    /// while draining or closed are rejected with an error frame instead
    /// of being processed.
    pub fn request_received(&self, raw: RawRequest) -> Result<(), NetworkError> {
        let request = {
            let mut active = self.inner.active.lock();
            // state is checked under the table lock so teardown either
            // sees this entry or rejects it here, never neither
            if self.inner.state.load(Ordering::SeqCst) != ChannelState::Open {
                drop(active);
                self.reject_raw(raw);
                return Ok(());
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let request = TrackedRequest::new(
                id,
                raw,
                self.inner.timer.clone(),
                self.inner.events_tx.clone(),
            );
            active.insert(id, request.clone());
            request
        };

        let on_deadline = {
            let request = request.clone();
            Box::new(move || request.deadline_elapsed())
        };
        let handle = self
            .inner
            .timer
            .register(self.inner.request_timeout, on_deadline);
        request.set_deadline(handle);

        let processor = self.inner.processor.clone();
        tokio::task::spawn(async move {
            processor.process(request).await;
        });

        Ok(())
    }

    fn reject_raw(&self, raw: RawRequest) {
        log::debug!(target: "rampart", "Rejecting request received on a {:?} connection to {}", self.state(), self.inner.peer_addr);
        if raw.oneway {
            return;
        }

        let frame = OutboundFrame::Error {
            kind: FrameErrorKind::ConnectionClosing,
            message: "connection closing".to_string(),
            headers: error_headers(&raw.headers, FrameErrorKind::ConnectionClosing),
        };
        if let Err(err) = self.inner.to_channel.unbounded_send(frame) {
            log::warn!(target: "rampart", "Unable to send rejection frame: {err}");
        }
    }

    /// Tears the connection down: every in-flight request is claimed for
    /// teardown (no frames are produced), the client-side tracker is
    /// notified, and the event loop is halted. Idempotent.
    pub fn channel_closed(&self, reason: NetworkError) {
        if self.inner.state.swap(ChannelState::Closed, Ordering::SeqCst) == ChannelState::Closed {
            return;
        }

        log::debug!(target: "rampart", "Connection to {} closed: {reason}", self.inner.peer_addr);
        let drained: Vec<TrackedRequest> =
            self.inner.active.lock().drain().map(|(_, req)| req).collect();
        for request in drained {
            request.connection_closing();
        }

        if let Some(tracker) = &self.inner.client_tracker {
            tracker.connection_closed(&reason);
        }

        self.signal_reclaim();
        let _ = self.inner.events_tx.send(ConnectionEvent::Halt);
    }

    /// Stops accepting new requests and finishes teardown once the last
    /// in-flight request completes
    pub fn stop(&self) {
        let _ = self.inner.state.compare_exchange(
            ChannelState::Open,
            ChannelState::Draining,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.maybe_finish_drain();
    }

    fn maybe_finish_drain(&self) {
        if self.inner.state.load(Ordering::SeqCst) != ChannelState::Draining
            || !self.inner.active.lock().is_empty()
        {
            return;
        }

        if self
            .inner
            .state
            .compare_exchange(
                ChannelState::Draining,
                ChannelState::Closed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            log::debug!(target: "rampart", "Connection to {} drained", self.inner.peer_addr);
            self.signal_reclaim();
            let _ = self.inner.events_tx.send(ConnectionEvent::Halt);
        }
    }

    fn signal_reclaim(&self) {
        if let Some(reclaim) = &self.inner.reclaim {
            let _ = reclaim.send(());
        }
    }

    /// Applies one completion on the loop task. The frame goes out only if
    /// this event actually removed the request and the connection has not
    /// been torn down since the outcome was produced.
    fn apply(&self, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Completed { id, frame } => {
                let removed = self.inner.active.lock().remove(&id);
                if removed.is_none() {
                    return true;
                }

                if self.inner.state.load(Ordering::SeqCst) != ChannelState::Closed {
                    if let Some(frame) = frame {
                        if let Err(err) = self.inner.to_channel.unbounded_send(frame) {
                            log::warn!(target: "rampart", "Unable to forward frame for request {id}: {err}");
                        }
                    }
                }

                self.maybe_finish_drain();
                true
            }

            ConnectionEvent::Halt => false,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.inner.peer_addr.describe())
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Drives completions for one connection. Ends on teardown or once every
/// event sender is gone.
pub struct ConnectionEventLoop {
    conn: Connection,
    rx: UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEventLoop {
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if !self.conn.apply(event) {
                break;
            }
        }

        log::trace!(target: "rampart", "Event loop for {} finished", self.conn.inner.peer_addr);
    }
}

/// Builds the headers attached to an outbound error frame: the peer's load
/// header is echoed back and the error kind code is attached
pub fn error_headers(recv: &HeaderMap, kind: FrameErrorKind) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(load) = recv.get(LOAD_HEADER) {
        headers.insert(LOAD_HEADER.to_string(), load.clone());
    }
    headers.insert(ERROR_KIND_HEADER.to_string(), kind.code().to_string());
    headers
}
