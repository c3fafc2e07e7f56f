#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::BytesMut;
    use futures::{FutureExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;

    use rampart_proto::constants::{ERROR_KIND_HEADER, LOAD_HEADER, TASK_EXPIRED_MESSAGE};
    use rampart_proto::prelude::*;
    use rampart_wire::SocketAddress;

    /// A wheel driven by hand so tests control exactly when deadlines fire
    #[derive(Default)]
    struct ManualWheel {
        callbacks: Mutex<HashMap<u64, TimerCallback>>,
        cancelled: Mutex<Vec<u64>>,
        next: AtomicU64,
    }

    impl ManualWheel {
        fn fire(&self, key: u64) {
            let callback = self.callbacks.lock().remove(&key);
            if let Some(callback) = callback {
                callback();
            }
        }

        fn cancelled_keys(&self) -> Vec<u64> {
            self.cancelled.lock().clone()
        }
    }

    impl TimerWheel for ManualWheel {
        fn register(&self, _delay: Duration, callback: TimerCallback) -> TimerHandle {
            let key = self.next.fetch_add(1, Ordering::Relaxed);
            self.callbacks.lock().insert(key, callback);
            TimerHandle::new(key)
        }

        fn cancel(&self, handle: &TimerHandle) {
            self.cancelled.lock().push(handle.key());
            self.callbacks.lock().remove(&handle.key());
        }
    }

    /// Hands every request straight back to the test instead of running
    /// application logic
    struct Capture {
        tx: UnboundedSender<TrackedRequest>,
    }

    #[async_trait]
    impl Processor for Capture {
        async fn process(&self, request: TrackedRequest) {
            let _ = self.tx.send(request);
        }
    }

    #[derive(Default)]
    struct RecordingTracker {
        reasons: Mutex<Vec<String>>,
    }

    impl ClientRequestTracker for RecordingTracker {
        fn connection_closed(&self, reason: &NetworkError) {
            self.reasons.lock().push(reason.to_string());
        }
    }

    struct Harness {
        conn: Connection,
        frames: OutboundFrameReceiver,
        wheel: Arc<ManualWheel>,
        requests: UnboundedReceiver<TrackedRequest>,
        reclaim: UnboundedReceiver<()>,
        tracker: Arc<RecordingTracker>,
        event_loop: JoinHandle<()>,
    }

    fn harness() -> Harness {
        rampart_logging::setup_log_no_panic_hook();

        let (to_channel, frames) = outbound_channel();
        let wheel = Arc::new(ManualWheel::default());
        let (capture_tx, requests) = tokio::sync::mpsc::unbounded_channel();
        let (reclaim_tx, reclaim) = tokio::sync::mpsc::unbounded_channel();
        let tracker = Arc::new(RecordingTracker::default());
        let config = ConnectionConfig {
            request_timeout: Duration::from_secs(5),
            reclaim: Some(reclaim_tx),
            client_tracker: Some(tracker.clone()),
        };

        let peer = SocketAddress::from_ip_port("127.0.0.1", 9090).unwrap();
        let (conn, event_loop) = Connection::new(
            peer,
            to_channel,
            wheel.clone(),
            Arc::new(Capture { tx: capture_tx }),
            config,
        );
        let event_loop = tokio::task::spawn(event_loop.run());

        Harness {
            conn,
            frames,
            wheel,
            requests,
            reclaim,
            tracker,
            event_loop,
        }
    }

    fn raw(oneway: bool) -> RawRequest {
        let mut headers = HeaderMap::new();
        headers.insert(LOAD_HEADER.to_string(), "7".to_string());
        RawRequest {
            payload: BytesMut::from(&b"ping"[..]),
            headers,
            oneway,
        }
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn assert_no_frame(frames: &mut OutboundFrameReceiver) {
        assert!(frames.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_reply_reaches_channel() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let request = h.requests.recv().await.unwrap();
        assert!(request.is_active());
        assert_eq!(h.conn.pending(), 1);
        assert_eq!(request.take_payload().unwrap(), &b"ping"[..]);
        assert!(request.take_payload().is_none());

        request
            .send_reply(BytesMut::from(&b"pong"[..]), HeaderMap::new())
            .unwrap();
        settle().await;

        match h.frames.next().await.unwrap() {
            OutboundFrame::Reply { payload, .. } => assert_eq!(payload, &b"pong"[..]),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(h.conn.pending(), 0);
        assert_eq!(request.state(), RequestState::Replied);
        // the deadline was deregistered when the reply claimed the request
        assert_eq!(h.wheel.cancelled_keys(), vec![0]);
    }

    #[tokio::test]
    async fn test_reply_notified_carries_completion_hook() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let request = h.requests.recv().await.unwrap();

        let (on_sent, sent) = tokio::sync::oneshot::channel();
        request
            .send_reply_notified(BytesMut::new(), HeaderMap::new(), on_sent)
            .unwrap();
        settle().await;

        match h.frames.next().await.unwrap() {
            OutboundFrame::Reply {
                on_sent: Some(hook),
                ..
            } => hook.send(()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
        sent.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_wins_and_late_reply_is_noop() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let request = h.requests.recv().await.unwrap();

        h.wheel.fire(0);
        settle().await;

        match h.frames.next().await.unwrap() {
            OutboundFrame::Error {
                kind,
                message,
                headers,
            } => {
                assert_eq!(kind, FrameErrorKind::TaskExpired);
                assert_eq!(message, TASK_EXPIRED_MESSAGE);
                assert_eq!(headers.get(LOAD_HEADER).map(String::as_str), Some("7"));
                assert_eq!(
                    headers.get(ERROR_KIND_HEADER).map(String::as_str),
                    Some("2")
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(h.conn.pending(), 0);
        assert_eq!(request.state(), RequestState::TimedOut);

        // a reply racing in after the deadline produces nothing further
        request
            .send_reply(BytesMut::from(&b"late"[..]), HeaderMap::new())
            .unwrap();
        settle().await;
        assert_no_frame(&mut h.frames);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_from_foreign_thread_suppresses_reply() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let request = h.requests.recv().await.unwrap();

        let remote = request.clone();
        tokio::task::spawn(async move { remote.cancel() })
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.conn.pending(), 0);
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_no_frame(&mut h.frames);

        // the losing reply is absorbed
        request
            .send_reply(BytesMut::new(), HeaderMap::new())
            .unwrap();
        settle().await;
        assert_no_frame(&mut h.frames);
        // cancelling again stays a no-op
        request.cancel();
    }

    #[tokio::test]
    async fn test_oneway_reply_is_a_protocol_violation() {
        let mut h = harness();

        h.conn.request_received(raw(true)).unwrap();
        let request = h.requests.recv().await.unwrap();

        let err = request
            .send_reply(BytesMut::new(), HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, NetworkError::ProtocolViolation(_)));
        // the failed reply must not consume the request's outcome
        assert!(request.is_active());
        assert_eq!(h.conn.pending(), 1);

        request.cancel();
        settle().await;
        assert_eq!(h.conn.pending(), 0);
        assert_no_frame(&mut h.frames);
    }

    #[tokio::test]
    async fn test_oneway_timeout_emits_no_frame() {
        let mut h = harness();

        h.conn.request_received(raw(true)).unwrap();
        let request = h.requests.recv().await.unwrap();

        h.wheel.fire(0);
        settle().await;

        assert_eq!(request.state(), RequestState::TimedOut);
        assert_eq!(h.conn.pending(), 0);
        assert_no_frame(&mut h.frames);
    }

    #[tokio::test]
    async fn test_oneway_error_emits_no_frame() {
        let mut h = harness();

        h.conn.request_received(raw(true)).unwrap();
        let request = h.requests.recv().await.unwrap();

        request
            .send_error(FrameErrorKind::InternalError, "handler failed")
            .unwrap();
        settle().await;

        assert_eq!(h.conn.pending(), 0);
        assert_no_frame(&mut h.frames);
    }

    #[tokio::test]
    async fn test_channel_closed_tears_everything_down() {
        let mut h = harness();

        let mut held = Vec::new();
        for _ in 0..3 {
            h.conn.request_received(raw(false)).unwrap();
            held.push(h.requests.recv().await.unwrap());
        }
        assert_eq!(h.conn.pending(), 3);

        h.conn
            .channel_closed(NetworkError::SocketError("peer reset".to_string()));
        settle().await;

        assert_eq!(h.conn.state(), ChannelState::Closed);
        assert_eq!(h.conn.pending(), 0);
        assert_no_frame(&mut h.frames);
        for request in &held {
            assert_eq!(request.state(), RequestState::ConnectionClosing);
        }

        // the duplex client side heard about it exactly once
        assert_eq!(h.tracker.reasons.lock().as_slice(), ["peer reset"]);
        h.reclaim.recv().await.unwrap();
        h.event_loop.await.unwrap();

        // replies landing after teardown never reach the channel
        held[0]
            .send_reply(BytesMut::new(), HeaderMap::new())
            .unwrap();
        assert_no_frame(&mut h.frames);

        // a second close is a no-op
        h.conn
            .channel_closed(NetworkError::Generic("again".to_string()));
        assert_eq!(h.tracker.reasons.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_draining_rejects_new_requests() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let request = h.requests.recv().await.unwrap();

        h.conn.stop();
        assert_eq!(h.conn.state(), ChannelState::Draining);

        // a two-way request arriving while draining is answered with an
        // error frame and never reaches the processor
        h.conn.request_received(raw(false)).unwrap();
        settle().await;
        assert!(h.requests.recv().now_or_never().is_none());
        match h.frames.next().await.unwrap() {
            OutboundFrame::Error { kind, headers, .. } => {
                assert_eq!(kind, FrameErrorKind::ConnectionClosing);
                assert_eq!(
                    headers.get(ERROR_KIND_HEADER).map(String::as_str),
                    Some("3")
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // a oneway rejection is silent
        h.conn.request_received(raw(true)).unwrap();
        settle().await;
        assert_no_frame(&mut h.frames);

        // the request accepted before the drain still completes normally
        request
            .send_reply(BytesMut::from(&b"done"[..]), HeaderMap::new())
            .unwrap();
        settle().await;
        assert!(matches!(
            h.frames.next().await.unwrap(),
            OutboundFrame::Reply { .. }
        ));

        assert_eq!(h.conn.state(), ChannelState::Closed);
        h.reclaim.recv().await.unwrap();
        h.event_loop.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_with_nothing_pending_finishes_immediately() {
        let mut h = harness();

        h.conn.stop();
        assert_eq!(h.conn.state(), ChannelState::Closed);
        h.reclaim.recv().await.unwrap();
        h.event_loop.await.unwrap();
        assert_no_frame(&mut h.frames);
    }

    #[tokio::test]
    async fn test_timeout_then_close_emits_only_the_first_frame() {
        let mut h = harness();

        h.conn.request_received(raw(false)).unwrap();
        let first = h.requests.recv().await.unwrap();
        h.conn.request_received(raw(false)).unwrap();
        let second = h.requests.recv().await.unwrap();

        h.wheel.fire(0);
        settle().await;
        assert!(matches!(
            h.frames.next().await.unwrap(),
            OutboundFrame::Error {
                kind: FrameErrorKind::TaskExpired,
                ..
            }
        ));
        assert_eq!(first.state(), RequestState::TimedOut);

        h.conn
            .channel_closed(NetworkError::SocketError("gone".to_string()));
        settle().await;
        assert_eq!(second.state(), RequestState::ConnectionClosing);
        assert_no_frame(&mut h.frames);
        h.event_loop.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_queue_wheel_fires_and_cancels() {
        rampart_logging::setup_log_no_panic_hook();

        let (wheel, worker) = DelayQueueWheel::new();
        let worker = tokio::task::spawn(worker);

        let (fired_tx, fired_rx) = tokio::sync::oneshot::channel();
        wheel.register(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = fired_tx.send(());
            }),
        );

        let (never_tx, mut never_rx) = tokio::sync::oneshot::channel();
        let handle = wheel.register(
            Duration::from_secs(1),
            Box::new(move || {
                let _ = never_tx.send(());
            }),
        );
        wheel.cancel(&handle);
        // cancelling twice is harmless
        wheel.cancel(&handle);

        fired_rx.await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(never_rx.try_recv().is_err());

        wheel.shutdown();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplex_merges_both_directions() {
        rampart_logging::setup_log_no_panic_hook();

        let (server_tx, server_rx) = outbound_channel();
        let (client_tx, client_rx) = outbound_channel();
        let (sink, mut merged_rx) = futures::channel::mpsc::unbounded();

        let coordinator = tokio::task::spawn(coordinate(server_rx, client_rx, sink));

        server_tx
            .unbounded_send(OutboundFrame::Reply {
                payload: BytesMut::from(&b"server"[..]),
                headers: HeaderMap::new(),
                on_sent: None,
            })
            .unwrap();
        client_tx
            .unbounded_send(OutboundFrame::Reply {
                payload: BytesMut::from(&b"client"[..]),
                headers: HeaderMap::new(),
                on_sent: None,
            })
            .unwrap();
        drop(server_tx);
        drop(client_tx);

        coordinator.await.unwrap().unwrap();

        let mut payloads = Vec::new();
        while let Some(frame) = merged_rx.next().await {
            match frame {
                OutboundFrame::Reply { payload, .. } => payloads.push(payload),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        payloads.sort();
        assert_eq!(payloads, vec![&b"client"[..], &b"server"[..]]);
    }
}
