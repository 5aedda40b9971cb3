//! Peer sessions.
//!
//! A session owns one stream to one peer. It answers pings, sends its own on
//! a fixed interval, and terminates when no pong arrives in time. Everything
//! that is not keep-alive traffic is forwarded to the router. However it
//! ends, the session reports its closure to the manager exactly once.

use crate::config::OverlayConfig;
use crate::manager::ManagerCommand;
use crate::router::RouterCommand;
use crate::transport::BoxedStream;
use crate::{P2pError, PeerId, Result, SessionId, TransportError};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};
use weft_protocol::{Message, MessageCodec, ProtocolError};

/// How long [`SessionHandle::send`] waits for queue space before giving up.
pub const OUTBOUND_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on flushing buffered frames when a session closes.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames decoded ahead of the session loop.
const READ_AHEAD: usize = 8;

/// Keep-alive timing for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Keepalive {
    pub ping_interval: Duration,
    pub timeout: Duration,
    pub pong_grace: Duration,
}

impl Keepalive {
    pub fn from_config(config: &OverlayConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            timeout: config.keep_alive(),
            pong_grace: config.pong_grace(),
        }
    }
}

/// Everything a new session needs besides its peer and stream.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub codec: Arc<dyn MessageCodec>,
    pub keepalive: Keepalive,
    pub outbound_queue: usize,
    pub router: mpsc::Sender<RouterCommand>,
    pub manager: mpsc::Sender<ManagerCommand>,
    pub shutdown: CancellationToken,
    pub span: Span,
}

/// Handle to a running session.
///
/// Cloning is cheap; every clone addresses the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: PeerId,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// The session instance.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The remote peer.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Queues `message` for delivery, waiting at most
    /// [`OUTBOUND_SEND_TIMEOUT`] for room in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Backpressure`] if the queue stayed full and
    /// [`P2pError::SessionClosed`] if the session has stopped.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(P2pError::SessionClosed(self.peer.clone()));
        }
        match self.outbound.send_timeout(message, OUTBOUND_SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(P2pError::Backpressure {
                peer: self.peer.clone(),
            }),
            Err(SendTimeoutError::Closed(_)) => Err(P2pError::SessionClosed(self.peer.clone())),
        }
    }

    /// Closes the stream and stops the session.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the session has been told to stop or has stopped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// Adapts a [`MessageCodec`] to tokio-util framing.
#[derive(Debug, Clone)]
pub(crate) struct FrameCodec(pub Arc<dyn MessageCodec>);

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Message>, ProtocolError> {
        self.0.decode(src)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> std::result::Result<(), ProtocolError> {
        self.0.encode(&item, dst)
    }
}

fn stream_error(err: ProtocolError) -> P2pError {
    match err {
        ProtocolError::Io(e) => TransportError::Stream(e).into(),
        other => other.into(),
    }
}

/// Starts a session for `peer` over `stream` and returns its handle.
pub(crate) fn spawn(
    ctx: &SessionContext,
    peer: PeerId,
    stream: BoxedStream,
    tasks: &mut JoinSet<()>,
) -> SessionHandle {
    let id = SessionId::next();
    let span = tracing::debug_span!(parent: &ctx.span, "session", peer = %peer.short_id(), session = %id);

    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.outbound_queue.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel(READ_AHEAD);
    let cancel = ctx.shutdown.child_token();

    let (read_half, write_half) = tokio::io::split(stream);
    let frames = FramedRead::new(read_half, FrameCodec(ctx.codec.clone()));
    let reader = tokio::spawn(read_frames(frames, inbound_tx).instrument(span.clone()));

    let session = Session {
        peer: peer.clone(),
        id,
        codec: ctx.codec.clone(),
        keepalive: ctx.keepalive,
        writer: FramedWrite::new(write_half, FrameCodec(ctx.codec.clone())),
        router: ctx.router.clone(),
        manager: ctx.manager.clone(),
        cancel: cancel.clone(),
        shutdown: ctx.shutdown.clone(),
    };
    tasks.spawn(session.run(outbound_rx, inbound_rx, reader).instrument(span));

    SessionHandle {
        id,
        peer,
        outbound: outbound_tx,
        cancel,
    }
}

/// Decodes frames off the read half until EOF or the first error.
async fn read_frames(
    mut frames: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    inbound: mpsc::Sender<std::result::Result<Message, ProtocolError>>,
) {
    while let Some(frame) = frames.next().await {
        let failed = frame.is_err();
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
    trace!("Reader finished");
}

struct Session {
    peer: PeerId,
    id: SessionId,
    codec: Arc<dyn MessageCodec>,
    keepalive: Keepalive,
    writer: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    router: mpsc::Sender<RouterCommand>,
    manager: mpsc::Sender<ManagerCommand>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Session {
    async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Message>,
        mut inbound: mpsc::Receiver<std::result::Result<Message, ProtocolError>>,
        reader: JoinHandle<()>,
    ) {
        let start = Instant::now();
        let mut ping = time::interval_at(start + self.keepalive.ping_interval, self.keepalive.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = time::sleep_until(start + self.keepalive.timeout);
        tokio::pin!(deadline);

        debug!("Session started");

        let outcome: Result<()> = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                () = &mut deadline => break Err(P2pError::Timeout(self.peer.clone())),
                _ = ping.tick() => {
                    if let Err(e) = self.send_ping().await {
                        break Err(e);
                    }
                }
                next = outbound.recv() => match next {
                    Some(message) => match self.write(message).await {
                        Ok(()) => {}
                        Err(e @ P2pError::Transport(_)) => break Err(e),
                        Err(e) => warn!(error = %e, "Dropping message the codec rejected"),
                    },
                    None => break Ok(()),
                },
                frame = inbound.recv() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(stream_error(e)),
                    Some(Ok(message)) => {
                        if self.codec.is_ping(&message) {
                            if let Err(e) = self.answer(&message).await {
                                break Err(e);
                            }
                        } else if self.codec.is_pong(&message) {
                            trace!("Pong received");
                            deadline.as_mut().reset(Instant::now() + self.keepalive.pong_grace);
                        } else if !self.forward(message).await {
                            break Ok(());
                        }
                    }
                },
            }
        };

        reader.abort();
        self.cancel.cancel();
        if time::timeout(CLOSE_TIMEOUT, self.writer.close()).await.is_err() {
            debug!("Stream did not close in time");
        }

        match &outcome {
            Ok(()) => debug!("Session closed"),
            Err(P2pError::Timeout(_)) => info!("Session timed out waiting for pong"),
            Err(e) => info!(error = %e, "Session terminated"),
        }

        let closed = ManagerCommand::SessionClosed {
            peer: self.peer.clone(),
            session: self.id,
        };
        tokio::select! {
            sent = self.manager.send(closed) => {
                if sent.is_err() {
                    trace!("Manager gone before closure report");
                }
            }
            () = self.shutdown.cancelled() => {}
        }
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        self.writer.send(message).await.map_err(stream_error)
    }

    async fn send_ping(&mut self) -> Result<()> {
        let ping = self.codec.build_ping(self.peer.as_str())?;
        trace!("Sending ping");
        self.write(ping).await
    }

    async fn answer(&mut self, ping: &Message) -> Result<()> {
        match self.codec.build_pong(ping) {
            Ok(pong) => self.write(pong).await,
            Err(e) => {
                warn!(error = %e, "Could not answer ping");
                Ok(())
            }
        }
    }

    /// Hands an application message to the router. Returns false if the
    /// session is stopping.
    async fn forward(&mut self, message: Message) -> bool {
        let command = RouterCommand::Inbound {
            peer: self.peer.clone(),
            message,
        };
        tokio::select! {
            sent = self.router.send(command) => sent.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;
    use weft_protocol::WireCodec;

    struct Harness {
        handle: SessionHandle,
        remote: Framed<DuplexStream, FrameCodec>,
        router_rx: mpsc::Receiver<RouterCommand>,
        manager_rx: mpsc::Receiver<ManagerCommand>,
        tasks: JoinSet<()>,
    }

    fn keepalive(timeout_secs: u64, grace_secs: u64) -> Keepalive {
        Keepalive {
            ping_interval: Duration::from_secs(timeout_secs / 3),
            timeout: Duration::from_secs(timeout_secs),
            pong_grace: Duration::from_secs(grace_secs),
        }
    }

    fn harness_with(keepalive: Keepalive, outbound_queue: usize, buffer: usize) -> Harness {
        let codec: Arc<dyn MessageCodec> = Arc::new(WireCodec::new());
        let (router_tx, router_rx) = mpsc::channel(16);
        let (manager_tx, manager_rx) = mpsc::channel(16);
        let ctx = SessionContext {
            codec: codec.clone(),
            keepalive,
            outbound_queue,
            router: router_tx,
            manager: manager_tx,
            shutdown: CancellationToken::new(),
            span: Span::none(),
        };

        let (local, remote) = tokio::io::duplex(buffer);
        let mut tasks = JoinSet::new();
        let handle = spawn(&ctx, PeerId::from("remote"), Box::new(local), &mut tasks);

        Harness {
            handle,
            remote: Framed::new(remote, FrameCodec(codec)),
            router_rx,
            manager_rx,
            tasks,
        }
    }

    fn harness() -> Harness {
        harness_with(keepalive(600, 600), 2, 64 * 1024)
    }

    fn assert_closed(command: Option<ManagerCommand>, expected: SessionId) {
        match command {
            Some(ManagerCommand::SessionClosed { peer, session }) => {
                assert_eq!(peer, PeerId::from("remote"));
                assert_eq!(session, expected);
            }
            other => panic!("expected SessionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let mut h = harness();

        h.remote.send(Message::ping(7)).await.unwrap();

        match h.remote.next().await.unwrap().unwrap() {
            Message::Pong(probe) => assert_eq!(probe.nonce(), 7),
            other => panic!("expected pong, got {other:?}"),
        }
        assert!(h.router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_application_messages_in_order() {
        let mut h = harness();
        let first = Message::direct(1, "first");
        let second = Message::gossip(1, "second");

        h.remote.send(first.clone()).await.unwrap();
        h.remote.send(second.clone()).await.unwrap();

        for expected in [first, second] {
            match h.router_rx.recv().await {
                Some(RouterCommand::Inbound { peer, message }) => {
                    assert_eq!(peer.as_str(), "remote");
                    assert_eq!(message, expected);
                }
                other => panic!("expected inbound, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn writes_outbound_messages_in_order() {
        let mut h = harness();
        let a = Message::direct(2, "a");
        let b = Message::direct(2, "b");

        h.handle.send(a.clone()).await.unwrap();
        h.handle.send(b.clone()).await.unwrap();

        assert_eq!(h.remote.next().await.unwrap().unwrap(), a);
        assert_eq!(h.remote.next().await.unwrap().unwrap(), b);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_third_of_keepalive() {
        let mut h = harness_with(keepalive(30, 600), 2, 64 * 1024);
        let start = Instant::now();

        let first = h.remote.next().await.unwrap().unwrap();
        assert!(matches!(first, Message::Ping(_)));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));

        h.remote.send(WireCodec::new().build_pong(&first).unwrap()).await.unwrap();

        let second = h.remote.next().await.unwrap().unwrap();
        assert!(matches!(second, Message::Ping(_)));
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_pong() {
        let mut h = harness_with(keepalive(30, 600), 2, 64 * 1024);
        let start = Instant::now();

        let closed = h.manager_rx.recv().await;
        assert_closed(closed, h.handle.id());
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_deadline_to_grace_period() {
        let mut h = harness_with(keepalive(30, 60), 2, 64 * 1024);
        let start = Instant::now();

        h.remote.send(Message::pong(1)).await.unwrap();

        let early = time::timeout(Duration::from_secs(45), h.manager_rx.recv()).await;
        assert!(early.is_err(), "session closed before the grace period");

        let closed = h.manager_rx.recv().await;
        assert_closed(closed, h.handle.id());
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn application_traffic_is_not_liveness() {
        let mut h = harness_with(keepalive(30, 600), 2, 64 * 1024);
        let start = Instant::now();

        for _ in 0..5 {
            time::sleep(Duration::from_secs(5)).await;
            h.remote.send(Message::direct(1, "chatter")).await.unwrap();
        }

        let closed = loop {
            tokio::select! {
                closed = h.manager_rx.recv() => break closed,
                _ = h.router_rx.recv() => {}
            }
        };
        assert_closed(closed, h.handle.id());
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn disconnect_reports_closure_once() {
        let mut h = harness();

        h.handle.disconnect();

        assert_closed(h.manager_rx.recv().await, h.handle.id());
        assert!(h.remote.next().await.is_none());

        while h.tasks.join_next().await.is_some() {}
        assert!(h.manager_rx.try_recv().is_err());

        let result = h.handle.send(Message::direct(1, "late")).await;
        assert!(matches!(result, Err(P2pError::SessionClosed(_))));
        assert!(h.handle.is_closed());
    }

    #[tokio::test]
    async fn oversized_message_is_dropped_and_session_survives() {
        let mut h = harness();
        let oversized = Message::direct(1, vec![0u8; weft_protocol::MAX_MESSAGE_SIZE + 1]);
        let after = Message::direct(1, "still here");

        h.handle.send(oversized).await.unwrap();
        h.handle.send(after.clone()).await.unwrap();

        assert_eq!(h.remote.next().await.unwrap().unwrap(), after);
        assert!(h.manager_rx.try_recv().is_err());
        assert!(!h.handle.is_closed());
    }

    #[tokio::test]
    async fn remote_eof_closes_session() {
        let mut h = harness();
        h.remote.get_mut().shutdown().await.unwrap();

        assert_closed(h.manager_rx.recv().await, h.handle.id());
    }

    #[tokio::test]
    async fn garbage_input_terminates_session() {
        let mut h = harness();

        h.remote
            .get_mut()
            .write_all(b"NOPE\x01\x00\x00\x00\x00")
            .await
            .unwrap();

        assert_closed(h.manager_rx.recv().await, h.handle.id());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_reports_backpressure() {
        let h = harness_with(keepalive(600, 600), 1, 64);
        let payload = vec![0u8; 1024];

        let mut outcome = Ok(());
        for _ in 0..8 {
            outcome = h.handle.send(Message::direct(1, payload.clone())).await;
            if outcome.is_err() {
                break;
            }
        }

        assert!(matches!(outcome, Err(P2pError::Backpressure { .. })));
    }
}
