use std::collections::HashMap;
use std::fmt::Formatter;
use std::pin::Pin;

use bytes::BytesMut;
use futures::task::{Context, Poll};
use futures::{Sink, Stream};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::UnboundedSender as UnboundedSenderInner;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::NetworkError;

/// Connection-unique identifier assigned to each tracked request
pub type RequestId = u64;

/// Request and response metadata headers
pub type HeaderMap = HashMap<String, String>;

/// A request as decoded off the channel, before it is tracked
#[derive(Debug)]
pub struct RawRequest {
    pub payload: BytesMut,
    pub headers: HeaderMap,
    /// Oneway requests never produce a frame on the channel
    pub oneway: bool,
}

/// The kind tag carried by outbound error frames
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameErrorKind {
    TaskExpired,
    ConnectionClosing,
    InternalError,
}

impl FrameErrorKind {
    /// Wire code written into the error-kind response header
    pub fn code(self) -> &'static str {
        match self {
            FrameErrorKind::InternalError => "0",
            FrameErrorKind::TaskExpired => "2",
            FrameErrorKind::ConnectionClosing => "3",
        }
    }
}

/// A frame bound for the transport channel
#[derive(Debug)]
pub enum OutboundFrame {
    Reply {
        payload: BytesMut,
        headers: HeaderMap,
        /// Fired once the frame has been handed to the channel
        on_sent: Option<oneshot::Sender<()>>,
    },
    Error {
        kind: FrameErrorKind,
        message: String,
        headers: HeaderMap,
    },
}

pub struct UnboundedSender<T>(pub(crate) UnboundedSenderInner<T>);

impl<T> Clone for UnboundedSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> UnboundedSender<T> {
    #[inline]
    pub fn unbounded_send(&self, item: T) -> Result<(), SendError<T>> {
        self.0.send(item)
    }
}

impl<T> Sink<T> for UnboundedSender<T> {
    type Error = NetworkError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.0.is_closed() {
            Poll::Ready(Err(NetworkError::InternalError("channel closed")))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.0
            .send(item)
            .map_err(|err| NetworkError::Generic(err.to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// The write half of a connection's outbound channel
#[derive(Clone)]
pub struct OutboundFrameSender(pub(crate) UnboundedSender<OutboundFrame>);

impl OutboundFrameSender {
    #[inline]
    pub fn unbounded_send(&self, frame: OutboundFrame) -> Result<(), NetworkError> {
        self.0
            .unbounded_send(frame)
            .map_err(|err| NetworkError::Generic(err.to_string()))
    }
}

impl Sink<OutboundFrame> for OutboundFrameSender {
    type Error = NetworkError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: OutboundFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_close(cx)
    }
}

impl std::fmt::Debug for OutboundFrameSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutboundFrameSender")
    }
}

/// The read half of a connection's outbound channel
pub struct OutboundFrameReceiver(pub UnboundedReceiverStream<OutboundFrame>);

impl Stream for OutboundFrameReceiver {
    type Item = OutboundFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

/// Creates the outbound frame channel for one direction of a connection
pub fn outbound_channel() -> (OutboundFrameSender, OutboundFrameReceiver) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (
        OutboundFrameSender(UnboundedSender(tx)),
        OutboundFrameReceiver(UnboundedReceiverStream::new(rx)),
    )
}
