#![forbid(unsafe_code)]
//! Connection and request lifecycle management for the Rampart transport.
//!
//! A [`proto::connection::Connection`] tracks every in-flight request
//! received on one transport channel, applies a per-request deadline
//! through a shared timer wheel, and coordinates replies, cancellations,
//! timeouts, and teardown so that at most one terminal outcome is ever
//! delivered per request.
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_features
)]

pub mod constants;
pub mod error;
pub mod proto;

pub mod prelude {
    pub use crate::constants::DEFAULT_REQUEST_TIMEOUT;
    pub use crate::error::NetworkError;
    pub use crate::proto::channel::{
        outbound_channel, FrameErrorKind, HeaderMap, OutboundFrame, OutboundFrameReceiver,
        OutboundFrameSender, RawRequest, RequestId,
    };
    pub use crate::proto::connection::{
        error_headers, ChannelState, Connection, ConnectionConfig, ConnectionEventLoop, Processor,
    };
    pub use crate::proto::duplex::{coordinate, ClientRequestTracker};
    pub use crate::proto::expiry::{DelayQueueWheel, TimerCallback, TimerHandle, TimerWheel};
    pub use crate::proto::request::{RequestState, TrackedRequest};
}
