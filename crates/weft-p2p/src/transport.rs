//! Substrate seams.
//!
//! The overlay does not dial sockets or run discovery itself. A substrate
//! (libp2p host, QUIC endpoint, the in-process [`crate::memory`] network)
//! implements [`Transport`] for outbound streams, hands inbound streams to an
//! [`InboundHandle`], and feeds peer lists into a [`DiscoverySink`] either
//! directly or through a polled [`Discovery`].

use crate::manager::ManagerCommand;
use crate::{P2pError, PeerId, Result, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// A bidirectional byte stream to one peer.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased stream.
pub type BoxedStream = Box<dyn Stream>;

/// Outbound half of the substrate.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Identity of the local host. May complete only after the substrate
    /// has bootstrapped.
    async fn host_identity(&self) -> std::result::Result<PeerId, TransportError>;

    /// Opens a stream to `peer` speaking `protocol`.
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> std::result::Result<BoxedStream, TransportError>;
}

/// Pull-based discovery, polled by the overlay on a fixed interval.
#[async_trait]
pub trait Discovery: Send + Sync + fmt::Debug + 'static {
    /// Returns the peers currently advertising `namespace`.
    async fn find_peers(&self, namespace: &str) -> std::result::Result<Vec<PeerId>, TransportError>;
}

/// Resolves once the session built from an accepted stream is removed.
///
/// Substrates whose stream handlers must stay alive for the lifetime of the
/// stream await this before returning.
#[derive(Debug)]
pub struct ExitSignal(oneshot::Receiver<()>);

impl ExitSignal {
    /// Waits until the session is gone.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// Entry point for streams the substrate accepted from remote peers.
#[derive(Debug, Clone)]
pub struct InboundHandle {
    manager: mpsc::Sender<ManagerCommand>,
    shutdown: CancellationToken,
}

impl InboundHandle {
    pub(crate) fn new(manager: mpsc::Sender<ManagerCommand>, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown }
    }

    /// Hands an inbound stream from `peer` to the overlay.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidPeerId`] for an empty ID and
    /// [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn accept(&self, peer: PeerId, stream: BoxedStream) -> Result<ExitSignal> {
        if peer.is_empty() {
            return Err(P2pError::InvalidPeerId(peer.to_string()));
        }

        let (exit, signal) = oneshot::channel();
        let command = ManagerCommand::Inbound { peer, stream, exit };
        tokio::select! {
            sent = self.manager.send(command) => sent.map_err(|_| P2pError::Shutdown)?,
            () = self.shutdown.cancelled() => return Err(P2pError::Shutdown),
        }
        Ok(ExitSignal(signal))
    }
}

/// Push-based discovery input.
///
/// Events arrive as `begin`, any number of `peer`, then `finish`; the
/// finished batch replaces the previous snapshot. Snapshots published faster
/// than the manager consumes them collapse to the newest one.
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    snapshots: Arc<watch::Sender<Vec<PeerId>>>,
    batch: Option<Vec<PeerId>>,
}

impl DiscoverySink {
    pub(crate) fn new(snapshots: Arc<watch::Sender<Vec<PeerId>>>) -> Self {
        Self {
            snapshots,
            batch: None,
        }
    }

    /// Starts a new snapshot, discarding any unfinished one.
    pub fn begin(&mut self) {
        self.batch = Some(Vec::new());
    }

    /// Adds a peer to the snapshot in progress.
    pub fn peer(&mut self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        match self.batch.as_mut() {
            Some(batch) => batch.push(peer),
            None => tracing::trace!(peer = %peer, "Discovery event outside a batch ignored"),
        }
    }

    /// Publishes the snapshot in progress.
    pub fn finish(&mut self) {
        if let Some(batch) = self.batch.take() {
            tracing::trace!(peers = batch.len(), "Discovery snapshot published");
            self.snapshots.send_replace(batch);
        }
    }

    /// Publishes `peers` as a complete snapshot.
    pub fn publish(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        self.begin();
        for peer in peers {
            self.peer(peer);
        }
        self.finish();
    }
}

/// Polls `discovery` every `interval` and feeds the results into `sink`.
pub(crate) async fn poll_discovery(
    discovery: Arc<dyn Discovery>,
    mut sink: DiscoverySink,
    namespace: String,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let found = tokio::select! {
            () = shutdown.cancelled() => break,
            found = discovery.find_peers(&namespace) => found,
        };

        match found {
            Ok(peers) => sink.publish(peers),
            Err(e) => tracing::warn!(namespace = %namespace, error = %e, "Discovery poll failed"),
        }
    }

    tracing::debug!("Discovery poller stopped");
}
