//! Duplex coordination: when a connection carries requests in both
//! directions over one transport channel, the server-side and client-side
//! outbound streams are merged fairly onto the single sink, and teardown
//! of the channel must reach the client-side request bookkeeping too.

use futures::{Sink, SinkExt, StreamExt};

use crate::error::NetworkError;
use crate::proto::channel::{OutboundFrame, OutboundFrameReceiver};

/// Client-side request bookkeeping that shares the transport channel with
/// a server connection. Invoked exactly once when that channel closes, so
/// outstanding client requests can be failed promptly instead of waiting
/// out their deadlines.
pub trait ClientRequestTracker: Send + Sync + 'static {
    fn connection_closed(&self, reason: &NetworkError);
}

/// Forwards frames from both directions of a duplex connection onto the
/// shared channel sink. Interleaving is fair: neither direction can starve
/// the other. Completes once both streams end, closing the sink.
pub async fn coordinate<S>(
    server: OutboundFrameReceiver,
    client: OutboundFrameReceiver,
    mut sink: S,
) -> Result<(), NetworkError>
where
    S: Sink<OutboundFrame> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut merged = futures::stream::select(server, client);
    while let Some(frame) = merged.next().await {
        sink.send(frame)
            .await
            .map_err(|err| NetworkError::SocketError(err.to_string()))?;
    }

    sink.close()
        .await
        .map_err(|err| NetworkError::SocketError(err.to_string()))?;
    Ok(())
}
