//! A single tracked request.
//!
//! Four outcomes race for every request: a reply from the processor, a
//! cancellation (possibly from a foreign thread), the deadline firing on
//! the timer wheel, and connection teardown. Exactly one may win. The
//! winner is decided by a single compare-exchange on the state word, so no
//! lock is held across the decision and a loser observes the claim
//! atomically.

use atomic::Atomic;
use bytemuck::NoUninit;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::constants::TASK_EXPIRED_MESSAGE;
use crate::error::NetworkError;
use crate::proto::channel::{FrameErrorKind, HeaderMap, OutboundFrame, RawRequest, RequestId};
use crate::proto::connection::{error_headers, ConnectionEvent};
use crate::proto::expiry::{TimerHandle, TimerWheel};

#[derive(Debug, Copy, Clone, Eq, PartialEq, NoUninit)]
#[repr(u8)]
pub enum RequestState {
    Active,
    Replied,
    Cancelled,
    TimedOut,
    ConnectionClosing,
}

/// Shared handle to one in-flight request. Clones refer to the same
/// request; any clone may deliver the terminal outcome, from any thread.
#[derive(Clone)]
pub struct TrackedRequest {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: RequestId,
    oneway: bool,
    headers: HeaderMap,
    payload: Mutex<Option<BytesMut>>,
    state: Atomic<RequestState>,
    deadline: Mutex<Option<TimerHandle>>,
    timer: Arc<dyn TimerWheel>,
    events: UnboundedSender<ConnectionEvent>,
}

impl TrackedRequest {
    pub(crate) fn new(
        id: RequestId,
        raw: RawRequest,
        timer: Arc<dyn TimerWheel>,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id,
                oneway: raw.oneway,
                headers: raw.headers,
                payload: Mutex::new(Some(raw.payload)),
                state: Atomic::new(RequestState::Active),
                deadline: Mutex::new(None),
                timer,
                events,
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn is_oneway(&self) -> bool {
        self.inner.oneway
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn state(&self) -> RequestState {
        self.inner.state.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.state() == RequestState::Active
    }

    /// Takes the request payload. Returns None on second and later calls.
    pub fn take_payload(&self) -> Option<BytesMut> {
        self.inner.payload.lock().take()
    }

    /// Attempts to move the request from Active into `next`. Exactly one
    /// caller per request ever succeeds.
    fn claim(&self, next: RequestState) -> bool {
        self.inner
            .state
            .compare_exchange(
                RequestState::Active,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn release_deadline(&self) {
        if let Some(handle) = self.inner.deadline.lock().take() {
            self.inner.timer.cancel(&handle);
        }
    }

    pub(crate) fn set_deadline(&self, handle: TimerHandle) {
        *self.inner.deadline.lock() = Some(handle);
    }

    fn emit(&self, frame: Option<OutboundFrame>) {
        if self
            .inner
            .events
            .send(ConnectionEvent::Completed {
                id: self.inner.id,
                frame,
            })
            .is_err()
        {
            log::trace!(target: "rampart", "Request {} completed after its connection loop ended", self.inner.id);
        }
    }

    /// Delivers the reply for this request. A no-op if another outcome
    /// already claimed the request; an error for oneway requests, whose
    /// state is left untouched.
    pub fn send_reply(&self, payload: BytesMut, headers: HeaderMap) -> Result<(), NetworkError> {
        self.reply_inner(payload, headers, None)
    }

    /// Like [`Self::send_reply`], additionally firing `on_sent` once the
    /// frame has been handed to the channel
    pub fn send_reply_notified(
        &self,
        payload: BytesMut,
        headers: HeaderMap,
        on_sent: oneshot::Sender<()>,
    ) -> Result<(), NetworkError> {
        self.reply_inner(payload, headers, Some(on_sent))
    }

    fn reply_inner(
        &self,
        payload: BytesMut,
        headers: HeaderMap,
        on_sent: Option<oneshot::Sender<()>>,
    ) -> Result<(), NetworkError> {
        if self.inner.oneway {
            log::warn!(target: "rampart", "Reply attempted for oneway request {}", self.inner.id);
            return Err(NetworkError::ProtocolViolation(
                "a oneway request cannot be replied to",
            ));
        }

        if !self.claim(RequestState::Replied) {
            // another outcome won; late replies are silently dropped
            return Ok(());
        }

        self.release_deadline();
        self.emit(Some(OutboundFrame::Reply {
            payload,
            headers,
            on_sent,
        }));
        Ok(())
    }

    /// Reports a processing failure as an error frame. Oneway requests
    /// complete without producing a frame.
    pub fn send_error(
        &self,
        kind: FrameErrorKind,
        message: impl Into<String>,
    ) -> Result<(), NetworkError> {
        if !self.claim(RequestState::Replied) {
            return Ok(());
        }

        self.release_deadline();
        let frame = if self.inner.oneway {
            None
        } else {
            Some(OutboundFrame::Error {
                kind,
                message: message.into(),
                headers: error_headers(&self.inner.headers, kind),
            })
        };
        self.emit(frame);
        Ok(())
    }

    /// Abandons the request without emitting any frame. Safe to call from
    /// any thread, any number of times.
    pub fn cancel(&self) {
        if !self.claim(RequestState::Cancelled) {
            return;
        }

        log::trace!(target: "rampart", "Request {} cancelled", self.inner.id);
        self.release_deadline();
        self.emit(None);
    }

    /// Runs on the timer wheel when the request deadline fires
    pub(crate) fn deadline_elapsed(&self) {
        if !self.claim(RequestState::TimedOut) {
            return;
        }

        log::debug!(target: "rampart", "Request {} expired before a reply was sent", self.inner.id);
        // the handle already fired; just clear the slot
        let _ = self.inner.deadline.lock().take();
        let frame = if self.inner.oneway {
            None
        } else {
            Some(OutboundFrame::Error {
                kind: FrameErrorKind::TaskExpired,
                message: TASK_EXPIRED_MESSAGE.to_string(),
                headers: error_headers(&self.inner.headers, FrameErrorKind::TaskExpired),
            })
        };
        self.emit(frame);
    }

    /// Claims the request on behalf of connection teardown. The caller is
    /// draining the request table itself, so no completion event is sent.
    pub(crate) fn connection_closing(&self) {
        if self.claim(RequestState::ConnectionClosing) {
            self.release_deadline();
        }
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        // last handle gone; an Active state here means the processor
        // dropped the request without delivering any outcome, so it is
        // treated as cancelled
        if self
            .state
            .compare_exchange(
                RequestState::Active,
                RequestState::Cancelled,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            log::warn!(target: "rampart", "Request {} dropped without an outcome", self.id);
            if let Some(handle) = self.deadline.lock().take() {
                self.timer.cancel(&handle);
            }
        }
    }
}

impl std::fmt::Debug for TrackedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("id", &self.inner.id)
            .field("oneway", &self.inner.oneway)
            .field("state", &self.state())
            .finish()
    }
}
