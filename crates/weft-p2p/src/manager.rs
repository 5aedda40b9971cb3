//! Peer manager.
//!
//! The manager is the authoritative directory of sessions. It reconciles the
//! active set against discovery snapshots, admits peers up to the connection
//! cap, accepts inbound streams, dials targets of deferred requests and tells
//! the router about every change.

use crate::config::OverlayConfig;
use crate::router::{RouteRequest, RouterCommand, Target};
use crate::session::{self, SessionContext, SessionHandle};
use crate::transport::{BoxedStream, Transport};
use crate::{P2pError, PeerId, Result, SessionId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause between attempts to learn the local host identity.
const HOST_IDENTITY_RETRY: Duration = Duration::from_secs(1);

pub(crate) enum ManagerCommand {
    Inbound {
        peer: PeerId,
        stream: BoxedStream,
        exit: oneshot::Sender<()>,
    },
    SessionClosed {
        peer: PeerId,
        session: SessionId,
    },
    Deferred(RouteRequest),
}

impl fmt::Debug for ManagerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound { peer, .. } => f.debug_struct("Inbound").field("peer", peer).finish_non_exhaustive(),
            Self::SessionClosed { peer, session } => f
                .debug_struct("SessionClosed")
                .field("peer", peer)
                .field("session", session)
                .finish(),
            Self::Deferred(request) => f.debug_tuple("Deferred").field(request).finish(),
        }
    }
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

struct DirectoryEntry {
    session: SessionHandle,
    direction: Direction,
    exit: Option<oneshot::Sender<()>>,
}

pub(crate) struct PeerManager {
    config: Arc<OverlayConfig>,
    transport: Arc<dyn Transport>,
    sessions: SessionContext,
    peers: HashMap<PeerId, DirectoryEntry>,
    idle: HashSet<PeerId>,
    known: HashSet<PeerId>,
    parked: VecDeque<RouteRequest>,
    local: Option<PeerId>,
    local_tx: watch::Sender<Option<PeerId>>,
    snapshots: watch::Receiver<Vec<PeerId>>,
    mailbox: mpsc::Receiver<ManagerCommand>,
    router: mpsc::Sender<RouterCommand>,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OverlayConfig>,
        transport: Arc<dyn Transport>,
        sessions: SessionContext,
        local_tx: watch::Sender<Option<PeerId>>,
        snapshots: watch::Receiver<Vec<PeerId>>,
        mailbox: mpsc::Receiver<ManagerCommand>,
        router: mpsc::Sender<RouterCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            sessions,
            peers: HashMap::new(),
            idle: HashSet::new(),
            known: HashSet::new(),
            parked: VecDeque::new(),
            local: None,
            local_tx,
            snapshots,
            mailbox,
            router,
            tasks: JoinSet::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let Some(local) = self.resolve_host().await else {
            return;
        };
        info!(local = %local, "Peer manager started");
        self.local = Some(local);

        let period = self.config.reconcile_interval();
        let mut reconcile = time::interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(command) = self.mailbox.recv() => self.handle(command).await,
                changed = self.snapshots.changed(), if discovery_open => {
                    if changed.is_err() {
                        debug!("Discovery feed closed");
                        discovery_open = false;
                        continue;
                    }
                    let snapshot = self.snapshots.borrow_and_update().clone();
                    self.reconcile(snapshot).await;
                    reconcile.reset();
                }
                _ = reconcile.tick() => {
                    if self.promote_idle().await {
                        self.publish_idle().await;
                    }
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }

        self.stop().await;
    }

    /// Waits for the substrate to report the local identity and publishes it.
    async fn resolve_host(&mut self) -> Option<PeerId> {
        loop {
            let identity = tokio::select! {
                () = self.shutdown.cancelled() => return None,
                identity = self.transport.host_identity() => identity,
            };
            match identity {
                Ok(local) => {
                    self.local_tx.send_replace(Some(local.clone()));
                    return Some(local);
                }
                Err(e) => warn!(error = %e, "Host identity unavailable, retrying"),
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = time::sleep(HOST_IDENTITY_RETRY) => {}
            }
        }
    }

    async fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Inbound { peer, stream, exit } => self.accept(peer, stream, exit).await,
            ManagerCommand::SessionClosed { peer, session } => self.session_closed(peer, session).await,
            ManagerCommand::Deferred(request) => self.deferred(request).await,
        }
    }

    /// Applies a discovery snapshot.
    async fn reconcile(&mut self, snapshot: Vec<PeerId>) {
        let wanted: HashSet<PeerId> = snapshot
            .into_iter()
            .filter(|p| !p.is_empty() && Some(p) != self.local.as_ref())
            .collect();

        let stale: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|p| !wanted.contains(*p))
            .cloned()
            .collect();
        for peer in stale {
            self.evict(&peer, "absent from discovery").await;
        }
        self.release_parked().await;

        self.idle = wanted
            .iter()
            .filter(|p| !self.peers.contains_key(*p))
            .cloned()
            .collect();
        self.known = wanted;

        debug!(
            active = self.peers.len(),
            idle = self.idle.len(),
            "Applied discovery snapshot"
        );

        self.promote_idle().await;
        self.publish_idle().await;
    }

    /// Dials idle peers until the cap is reached. Returns true if any
    /// peer became active.
    async fn promote_idle(&mut self) -> bool {
        let mut candidates: Vec<PeerId> = self.idle.iter().cloned().collect();
        candidates.sort();

        let mut promoted = false;
        for peer in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.dial(&peer).await {
                Ok(()) => promoted = true,
                Err(P2pError::AdmissionRejected { max }) => {
                    debug!(max, idle = self.idle.len(), "Connection cap reached");
                    break;
                }
                Err(e) => debug!(peer = %peer, error = %e, "Dial failed, peer stays idle"),
            }
        }
        promoted
    }

    /// Opens an outbound session to `peer`, respecting the cap.
    async fn dial(&mut self, peer: &PeerId) -> Result<()> {
        if self.config.at_capacity(self.peers.len()) {
            return Err(P2pError::AdmissionRejected {
                max: self.config.max_connected_peers,
            });
        }

        let transport = self.transport.clone();
        let open = time::timeout(
            self.config.connect_timeout(),
            transport.open_stream(peer, &self.config.protocol_id),
        );
        let stream = tokio::select! {
            () = self.shutdown.cancelled() => return Err(P2pError::Shutdown),
            opened = open => opened.map_err(|_| P2pError::Timeout(peer.clone()))??,
        };

        self.install(peer.clone(), stream, Direction::Outbound, None).await;
        self.idle.remove(peer);
        Ok(())
    }

    async fn accept(&mut self, peer: PeerId, stream: BoxedStream, exit: oneshot::Sender<()>) {
        if Some(&peer) == self.local.as_ref() {
            debug!("Refusing inbound stream from self");
            let _ = exit.send(());
            return;
        }

        if let Some(entry) = self.peers.get(&peer) {
            // Both sides dialed at once: keep the stream opened by the lower ID.
            let keep_outbound = entry.direction == Direction::Outbound
                && !entry.session.is_closed()
                && self.local.as_ref().is_some_and(|local| *local < peer);
            if keep_outbound {
                debug!(peer = %peer, "Simultaneous dial, keeping outbound session");
                let _ = exit.send(());
                return;
            }
            self.evict(&peer, "replaced by inbound stream").await;
        }

        self.install(peer.clone(), stream, Direction::Inbound, Some(exit)).await;
        if self.idle.remove(&peer) {
            self.publish_idle().await;
        }
    }

    async fn install(
        &mut self,
        peer: PeerId,
        stream: BoxedStream,
        direction: Direction,
        exit: Option<oneshot::Sender<()>>,
    ) {
        if self.peers.contains_key(&peer) {
            self.evict(&peer, "replaced").await;
        }

        let session = session::spawn(&self.sessions, peer.clone(), stream, &mut self.tasks);
        info!(peer = %peer, session = %session.id(), ?direction, "Peer connected");

        self.peers.insert(
            peer,
            DirectoryEntry {
                session: session.clone(),
                direction,
                exit,
            },
        );
        self.notify(RouterCommand::AddPeer(session)).await;
    }

    async fn evict(&mut self, peer: &PeerId, reason: &str) {
        let Some(entry) = self.peers.remove(peer) else {
            return;
        };
        entry.session.disconnect();
        if let Some(exit) = entry.exit {
            let _ = exit.send(());
        }
        info!(peer = %peer, session = %entry.session.id(), reason, "Peer disconnected");
        self.notify(RouterCommand::RemovePeer {
            peer: peer.clone(),
            session: entry.session.id(),
        })
        .await;
    }

    async fn session_closed(&mut self, peer: PeerId, session: SessionId) {
        let current = self.peers.get(&peer).map(|e| e.session.id());
        if current != Some(session) {
            trace!(peer = %peer, session = %session, "Ignoring stale closure");
            return;
        }

        self.evict(&peer, "session closed").await;
        if self.known.contains(&peer) && self.idle.insert(peer) {
            self.publish_idle().await;
        }
        self.release_parked().await;
    }

    async fn deferred(&mut self, request: RouteRequest) {
        let Target::Peer(peer) = &request.target else {
            self.notify(RouterCommand::Dispatch(request)).await;
            return;
        };
        let peer = peer.clone();

        if self.peers.contains_key(&peer) || Some(&peer) == self.local.as_ref() {
            self.notify(RouterCommand::Dispatch(request)).await;
            return;
        }

        let was_idle = self.idle.contains(&peer);
        match self.dial(&peer).await {
            Ok(()) => {
                if was_idle {
                    self.publish_idle().await;
                }
            }
            Err(P2pError::AdmissionRejected { max }) if self.parked.len() < self.config.mailbox_size => {
                debug!(peer = %peer, max, "Connection cap reached, holding request");
                self.parked.push_back(request);
                return;
            }
            Err(e) => debug!(
                peer = %peer,
                attempt = request.attempts,
                error = %e,
                "Deferred dial failed"
            ),
        }
        self.notify(RouterCommand::Dispatch(request)).await;
    }

    /// Retries requests held back at the cap once a slot is free.
    async fn release_parked(&mut self) {
        if self.parked.is_empty() || self.config.at_capacity(self.peers.len()) {
            return;
        }
        trace!(parked = self.parked.len(), "Releasing held requests");
        for request in std::mem::take(&mut self.parked) {
            self.deferred(request).await;
        }
    }

    async fn publish_idle(&self) {
        let mut idle: Vec<PeerId> = self.idle.iter().cloned().collect();
        idle.sort();
        self.notify(RouterCommand::IdlePeers(idle)).await;
    }

    async fn notify(&self, command: RouterCommand) {
        tokio::select! {
            sent = self.router.send(command) => {
                if sent.is_err() {
                    trace!("Router gone");
                }
            }
            () = self.shutdown.cancelled() => {}
        }
    }

    async fn stop(&mut self) {
        for (_, entry) in self.peers.drain() {
            entry.session.disconnect();
            if let Some(exit) = entry.exit {
                let _ = exit.send(());
            }
        }
        while self.tasks.join_next().await.is_some() {}
        debug!(dropped = self.parked.len(), "Peer manager stopped");
    }
}
