//! Request router.
//!
//! The router keeps its own mirror of the active sessions, fed by the
//! manager, and uses it to deliver outbound requests. Inbound application
//! messages pass through here too so the gossip check and the relay happen
//! in one event.

use crate::dedup::SeenSet;
use crate::manager::ManagerCommand;
use crate::overlay::MessageObserver;
use crate::session::SessionHandle;
use crate::{P2pError, PeerId, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use weft_protocol::{Message, MessageId};

/// Dispatch attempts allowed for a request whose target is not connected.
pub const MAX_ATTEMPTS: u32 = 10;

/// Where a request should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every peer active when the request is dispatched.
    Broadcast,
    /// A single peer, dialed on demand if not connected.
    Peer(PeerId),
}

impl From<PeerId> for Target {
    /// The empty peer ID means everyone.
    fn from(peer: PeerId) -> Self {
        if peer.is_empty() {
            Self::Broadcast
        } else {
            Self::Peer(peer)
        }
    }
}

impl From<&str> for Target {
    fn from(peer: &str) -> Self {
        PeerId::from(peer).into()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Peer(peer) => write!(f, "{peer}"),
        }
    }
}

/// A message on its way to a target.
#[derive(Debug, Clone)]
pub(crate) struct RouteRequest {
    pub target: Target,
    pub message: Message,
    pub attempts: u32,
}

impl RouteRequest {
    pub fn new(target: Target, message: Message) -> Self {
        Self {
            target,
            message,
            attempts: 0,
        }
    }
}

/// Why a request was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The target stayed unreachable for [`MAX_ATTEMPTS`] dispatches.
    RetryExhausted,
    /// The target's outbound queue stayed full.
    Backpressure,
    /// The target's session stopped before the message was queued.
    SessionClosed,
    /// The manager could not take the request.
    ManagerUnavailable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryExhausted => f.write_str("retry exhausted"),
            Self::Backpressure => f.write_str("backpressure"),
            Self::SessionClosed => f.write_str("session closed"),
            Self::ManagerUnavailable => f.write_str("manager unavailable"),
        }
    }
}

/// A request the overlay gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Where the message was headed.
    pub target: Target,
    /// Identity of the dropped message.
    pub message_id: MessageId,
    /// Dispatch attempts made.
    pub attempts: u32,
    /// Why it was dropped.
    pub reason: FailureReason,
}

/// Read-only view of the router's peers, handed to queries.
#[derive(Debug)]
pub struct PeerView<'a> {
    active: &'a HashMap<PeerId, SessionHandle>,
    idle: &'a [PeerId],
}

impl PeerView<'_> {
    /// Connected peers, in no particular order.
    pub fn active(&self) -> impl Iterator<Item = &PeerId> {
        self.active.keys()
    }

    /// Known but unconnected peers.
    pub fn idle(&self) -> &[PeerId] {
        self.idle
    }

    /// Returns true if `peer` has a live session.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.active.contains_key(peer)
    }

    /// Number of connected peers.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Active and idle peers, sorted.
    pub fn all(&self) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self.active.keys().chain(self.idle).cloned().collect();
        all.sort();
        all.dedup();
        all
    }
}

pub(crate) type Query = Box<dyn FnOnce(&PeerView<'_>) + Send>;

pub(crate) enum RouterCommand {
    AddPeer(SessionHandle),
    RemovePeer { peer: PeerId, session: SessionId },
    IdlePeers(Vec<PeerId>),
    Dispatch(RouteRequest),
    Inbound { peer: PeerId, message: Message },
    Query(Query),
}

impl fmt::Debug for RouterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddPeer(session) => f.debug_tuple("AddPeer").field(session).finish(),
            Self::RemovePeer { peer, session } => f
                .debug_struct("RemovePeer")
                .field("peer", peer)
                .field("session", session)
                .finish(),
            Self::IdlePeers(idle) => f.debug_tuple("IdlePeers").field(idle).finish(),
            Self::Dispatch(request) => f.debug_tuple("Dispatch").field(request).finish(),
            Self::Inbound { peer, message } => f
                .debug_struct("Inbound")
                .field("peer", peer)
                .field("message", message)
                .finish(),
            Self::Query(_) => f.write_str("Query"),
        }
    }
}

pub(crate) struct Router {
    peers: HashMap<PeerId, SessionHandle>,
    idle: Vec<PeerId>,
    seen: SeenSet,
    observer: Arc<dyn MessageObserver>,
    manager: mpsc::Sender<ManagerCommand>,
    failures: broadcast::Sender<DeliveryFailure>,
    mailbox: mpsc::Receiver<RouterCommand>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(
        dedup_capacity: usize,
        observer: Arc<dyn MessageObserver>,
        manager: mpsc::Sender<ManagerCommand>,
        failures: broadcast::Sender<DeliveryFailure>,
        mailbox: mpsc::Receiver<RouterCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            peers: HashMap::new(),
            idle: Vec::new(),
            seen: SeenSet::new(dedup_capacity),
            observer,
            manager,
            failures,
            mailbox,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!("Request router started");
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        debug!(peers = self.peers.len(), "Request router stopped");
    }

    async fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::AddPeer(session) => self.add_peer(session),
            RouterCommand::RemovePeer { peer, session } => self.remove_peer(&peer, session),
            RouterCommand::IdlePeers(idle) => {
                trace!(idle = idle.len(), "Idle list updated");
                self.idle = idle;
            }
            RouterCommand::Dispatch(request) => self.dispatch(request).await,
            RouterCommand::Inbound { peer, message } => self.inbound(peer, message).await,
            RouterCommand::Query(query) => query(&PeerView {
                active: &self.peers,
                idle: &self.idle,
            }),
        }
    }

    fn add_peer(&mut self, session: SessionHandle) {
        let peer = session.peer_id().clone();
        if self.peers.get(&peer).is_some_and(|current| current.id() == session.id()) {
            return;
        }
        trace!(peer = %peer, session = %session.id(), "Tracking peer");
        self.peers.insert(peer, session);
    }

    fn remove_peer(&mut self, peer: &PeerId, session: SessionId) {
        if self.peers.get(peer).is_some_and(|s| s.id() == session) {
            self.peers.remove(peer);
            trace!(peer = %peer, session = %session, "Untracking peer");
        }
    }

    async fn dispatch(&mut self, mut request: RouteRequest) {
        let peer = match &request.target {
            Target::Broadcast => {
                self.broadcast(&request.message, None).await;
                return;
            }
            Target::Peer(peer) => peer.clone(),
        };

        if let Some(session) = self.peers.get(&peer).cloned() {
            if let Err(e) = session.send(request.message.clone()).await {
                self.report(&request, &e);
            }
            return;
        }

        if request.attempts >= MAX_ATTEMPTS {
            let err = P2pError::RetryExhausted {
                peer,
                attempts: request.attempts,
            };
            self.report(&request, &err);
            return;
        }

        request.attempts += 1;
        trace!(peer = %peer, attempt = request.attempts, "Target not connected, deferring");
        if let Err(e) = self.manager.try_send(ManagerCommand::Deferred(request)) {
            if let ManagerCommand::Deferred(request) = e.into_inner() {
                self.fail(&request, FailureReason::ManagerUnavailable);
            }
        }
    }

    /// Sends `message` to every tracked peer except `skip`.
    async fn broadcast(&mut self, message: &Message, skip: Option<&PeerId>) {
        if message.is_gossip() {
            self.seen.insert(message.id());
        }

        let sessions: Vec<SessionHandle> = self
            .peers
            .values()
            .filter(|s| Some(s.peer_id()) != skip)
            .cloned()
            .collect();

        trace!(id = %message.id(), peers = sessions.len(), "Broadcasting");
        for session in sessions {
            if let Err(e) = session.send(message.clone()).await {
                let request = RouteRequest::new(Target::Peer(session.peer_id().clone()), message.clone());
                self.report(&request, &e);
            }
        }
    }

    async fn inbound(&mut self, peer: PeerId, message: Message) {
        if message.is_gossip() && !self.seen.contains(&message.id()) {
            self.broadcast(&message, Some(&peer)).await;
        }
        self.observer.on_message_arrived(&peer, &message);
    }

    fn report(&self, request: &RouteRequest, err: &P2pError) {
        let reason = match err {
            P2pError::RetryExhausted { .. } => FailureReason::RetryExhausted,
            P2pError::Backpressure { .. } => FailureReason::Backpressure,
            _ => FailureReason::SessionClosed,
        };
        warn!(target_peer = %request.target, id = %request.message.id(), error = %err, "Dropping request");
        self.publish(request, reason);
    }

    fn fail(&self, request: &RouteRequest, reason: FailureReason) {
        warn!(target_peer = %request.target, id = %request.message.id(), %reason, "Dropping request");
        self.publish(request, reason);
    }

    fn publish(&self, request: &RouteRequest, reason: FailureReason) {
        // No subscribers is fine.
        let _ = self.failures.send(DeliveryFailure {
            target: request.target.clone(),
            message_id: request.message.id(),
            attempts: request.attempts,
            reason,
        });
    }
}
