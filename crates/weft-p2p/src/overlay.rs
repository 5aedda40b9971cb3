//! Overlay facade.
//!
//! [`Overlay`] wires the peer manager, the request router and the optional
//! discovery poller together and is the only type applications talk to.

use crate::config::OverlayConfig;
use crate::manager::{ManagerCommand, PeerManager};
use crate::router::{DeliveryFailure, PeerView, RouteRequest, Router, RouterCommand, Target};
use crate::session::{Keepalive, SessionContext};
use crate::transport::{self, Discovery, DiscoverySink, InboundHandle, Transport};
use crate::{P2pError, PeerId, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument, Span};
use validator::Validate;
use weft_protocol::{Message, MessageCodec, WireCodec};

/// Capacity of the delivery failure channel.
const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Receives application messages arriving from peers.
///
/// Called from the router task once per inbound application message, so
/// implementations must return quickly.
pub trait MessageObserver: Send + Sync + 'static {
    /// `message` arrived from `peer`.
    fn on_message_arrived(&self, peer: &PeerId, message: &Message);
}

impl<F> MessageObserver for F
where
    F: Fn(&PeerId, &Message) + Send + Sync + 'static,
{
    fn on_message_arrived(&self, peer: &PeerId, message: &Message) {
        self(peer, message);
    }
}

/// Builder for [`Overlay`].
pub struct OverlayBuilder {
    config: OverlayConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec>,
    observer: Option<Arc<dyn MessageObserver>>,
    discovery: Option<Arc<dyn Discovery>>,
    span: Span,
}

impl fmt::Debug for OverlayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("codec", &self.codec)
            .field("observer", &self.observer.is_some())
            .field("discovery", &self.discovery)
            .finish()
    }
}

impl OverlayBuilder {
    /// Uses `codec` instead of [`WireCodec`].
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the application observer. Required.
    pub fn observer(mut self, observer: impl MessageObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Polls `discovery` for peers every
    /// [`OverlayConfig::discovery_interval`].
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Parent span for every task the overlay starts.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Validates the configuration and starts the overlay tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::NoObserverConfigured`] without an observer and
    /// [`P2pError::Config`] for an invalid configuration.
    pub fn build(self) -> Result<Overlay> {
        let observer = self.observer.ok_or(P2pError::NoObserverConfigured)?;
        self.config.validate()?;
        let config = Arc::new(self.config);

        let shutdown = CancellationToken::new();
        let (router_tx, router_rx) = mpsc::channel(config.mailbox_size);
        let (manager_tx, manager_rx) = mpsc::channel(config.mailbox_size);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let (local_tx, local) = watch::channel(None);
        let (snapshots_tx, snapshots_rx) = watch::channel(Vec::new());
        let snapshots = Arc::new(snapshots_tx);

        let router_span = tracing::info_span!(parent: &self.span, "router");
        let manager_span = tracing::info_span!(parent: &self.span, "peer_manager");

        let router = Router::new(
            config.dedup_capacity,
            observer,
            manager_tx.clone(),
            failures.clone(),
            router_rx,
            shutdown.clone(),
        );

        let sessions = SessionContext {
            codec: self.codec.clone(),
            keepalive: Keepalive::from_config(&config),
            outbound_queue: config.outbound_queue,
            router: router_tx.clone(),
            manager: manager_tx.clone(),
            shutdown: shutdown.clone(),
            span: manager_span.clone(),
        };
        let manager = PeerManager::new(
            config.clone(),
            self.transport.clone(),
            sessions,
            local_tx,
            snapshots_rx,
            manager_rx,
            router_tx.clone(),
            shutdown.clone(),
        );

        let mut tasks = vec![
            tokio::spawn(router.run().instrument(router_span)),
            tokio::spawn(manager.run().instrument(manager_span)),
        ];

        if let Some(discovery) = self.discovery {
            let poller = transport::poll_discovery(
                discovery,
                DiscoverySink::new(snapshots.clone()),
                config.namespace.clone(),
                config.discovery_interval(),
                shutdown.clone(),
            );
            let span = tracing::info_span!(parent: &self.span, "discovery", namespace = %config.namespace);
            tasks.push(tokio::spawn(poller.instrument(span)));
        }

        info!(
            namespace = %config.namespace,
            max_peers = config.max_connected_peers,
            "Overlay started"
        );

        Ok(Overlay {
            config,
            codec: self.codec,
            router: router_tx,
            manager: manager_tx,
            snapshots,
            local,
            failures,
            shutdown,
            tasks,
        })
    }
}

/// A running overlay node.
///
/// Dropping the overlay stops its tasks; [`Overlay::shutdown`] also waits for
/// them.
#[derive(Debug)]
pub struct Overlay {
    config: Arc<OverlayConfig>,
    codec: Arc<dyn MessageCodec>,
    router: mpsc::Sender<RouterCommand>,
    manager: mpsc::Sender<ManagerCommand>,
    snapshots: Arc<watch::Sender<Vec<PeerId>>>,
    local: watch::Receiver<Option<PeerId>>,
    failures: broadcast::Sender<DeliveryFailure>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Overlay {
    /// Starts building an overlay over `transport`.
    pub fn builder(config: OverlayConfig, transport: Arc<dyn Transport>) -> OverlayBuilder {
        OverlayBuilder {
            config,
            transport,
            codec: Arc::new(WireCodec::new()),
            observer: None,
            discovery: None,
            span: Span::current(),
        }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Queues `message` for `target`.
    ///
    /// Targeted sends to unconnected peers dial on demand and are dropped
    /// after [`crate::MAX_ATTEMPTS`] dispatches; see
    /// [`Overlay::delivery_failures`].
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Protocol`] if the codec cannot encode `message`
    /// and [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn send_to(&self, target: impl Into<Target>, message: Message) -> Result<()> {
        self.codec.validate(&message)?;
        self.command(RouterCommand::Dispatch(RouteRequest::new(target.into(), message)))
            .await
    }

    /// Sends `message` to every connected peer.
    ///
    /// # Errors
    ///
    /// Same as [`Overlay::send_to`].
    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send_to(Target::Broadcast, message).await
    }

    /// Runs `query` against a consistent view of the router's peers.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn query<F, R>(&self, query: F) -> Result<R>
    where
        F: FnOnce(&PeerView<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.command(RouterCommand::Query(Box::new(move |view: &PeerView<'_>| {
            let _ = tx.send(query(view));
        })))
        .await?;
        rx.await.map_err(|_| P2pError::Shutdown)
    }

    /// Calls `callback` with every active and idle peer.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn list_peers<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Vec<PeerId>) + Send + 'static,
    {
        self.command(RouterCommand::Query(Box::new(move |view: &PeerView<'_>| {
            callback(view.all());
        })))
        .await
    }

    /// Every active and idle peer, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        self.query(|view| view.all()).await
    }

    /// Connected peers, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] once the overlay has stopped.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.query(|view| {
            let mut active: Vec<PeerId> = view.active().cloned().collect();
            active.sort();
            active
        })
        .await
    }

    /// The local host identity, once the substrate has reported it.
    pub fn local_id(&self) -> Option<PeerId> {
        self.local.borrow().clone()
    }

    /// Waits for the local host identity.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the overlay stops first.
    pub async fn wait_until_ready(&self) -> Result<PeerId> {
        let mut local = self.local.clone();
        let ready = local
            .wait_for(Option::is_some)
            .await
            .map_err(|_| P2pError::Shutdown)?;
        ready.clone().ok_or(P2pError::Shutdown)
    }

    /// Handle the substrate uses to deliver inbound streams.
    pub fn inbound_handle(&self) -> InboundHandle {
        InboundHandle::new(self.manager.clone(), self.shutdown.clone())
    }

    /// Sink the substrate uses to push discovery snapshots.
    pub fn discovery_sink(&self) -> DiscoverySink {
        DiscoverySink::new(self.snapshots.clone())
    }

    /// Subscribes to requests the overlay gave up on.
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        info!("Overlay stopped");
    }

    async fn command(&self, command: RouterCommand) -> Result<()> {
        tokio::select! {
            sent = self.router.send(command) => sent.map_err(|_| P2pError::Shutdown),
            () = self.shutdown.cancelled() => Err(P2pError::Shutdown),
        }
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(MemoryNetwork::new().join("solo", "test"))
    }

    #[tokio::test]
    async fn build_requires_observer() {
        let result = Overlay::builder(OverlayConfig::new("test"), transport()).build();
        assert!(matches!(result, Err(P2pError::NoObserverConfigured)));
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let config = OverlayConfig::new("test").with_outbound_queue(0);
        let result = Overlay::builder(config, transport())
            .observer(|_: &PeerId, _: &Message| {})
            .build();
        assert!(matches!(result, Err(P2pError::Config(_))));
    }

    #[tokio::test]
    async fn ready_after_host_identity() {
        let overlay = Overlay::builder(OverlayConfig::new("test"), transport())
            .observer(|_: &PeerId, _: &Message| {})
            .build()
            .unwrap();

        let id = overlay.wait_until_ready().await.unwrap();
        assert_eq!(id, PeerId::from("solo"));
        assert_eq!(overlay.local_id(), Some(id));
        assert!(overlay.peers().await.unwrap().is_empty());

        overlay.shutdown().await;
    }

    #[tokio::test]
    async fn unencodable_message_is_rejected_up_front() {
        let overlay = Overlay::builder(OverlayConfig::new("test"), transport())
            .codec(Arc::new(WireCodec::with_max_message_size(64)))
            .observer(|_: &PeerId, _: &Message| {})
            .build()
            .unwrap();

        let result = overlay.broadcast(Message::direct(1, vec![0u8; 128])).await;
        assert!(matches!(
            result,
            Err(P2pError::Protocol(weft_protocol::ProtocolError::TooLarge { .. }))
        ));
        let result = overlay.send_to("peer", Message::direct(1, vec![0u8; 128])).await;
        assert!(matches!(result, Err(P2pError::Protocol(_))));

        overlay.broadcast(Message::direct(1, "small")).await.unwrap();
        overlay.shutdown().await;
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let overlay = Overlay::builder(OverlayConfig::new("test"), transport())
            .observer(|_: &PeerId, _: &Message| {})
            .build()
            .unwrap();
        let router = overlay.router.clone();
        let shutdown = overlay.shutdown.clone();
        overlay.shutdown().await;

        assert!(shutdown.is_cancelled());
        assert!(router.is_closed());
    }
}
