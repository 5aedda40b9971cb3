//! In-process substrate.
//!
//! Nodes join a shared [`MemoryNetwork`] under a namespace. Dialing pairs the
//! two ends of a `tokio::io::duplex` pipe and hands the far end to the
//! target's [`InboundHandle`]. Discovery lists every node in a namespace.
//! Reachability can be toggled per node to simulate partitions.

use crate::transport::{BoxedStream, Discovery, InboundHandle, Transport};
use crate::{PeerId, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Buffer size of each in-memory pipe.
const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
struct Node {
    namespace: String,
    inbound: Option<InboundHandle>,
    reachable: bool,
}

/// Shared registry of in-memory nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, Node>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` under `namespace` and returns its transport.
    ///
    /// The node is discoverable at once but refuses streams until an
    /// [`InboundHandle`] is attached.
    pub fn join(&self, id: impl Into<PeerId>, namespace: &str) -> MemoryTransport {
        let id = id.into();
        self.nodes.lock().insert(
            id.clone(),
            Node {
                namespace: namespace.to_string(),
                inbound: None,
                reachable: true,
            },
        );
        MemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Removes `id` from the network.
    pub fn leave(&self, id: &PeerId) {
        self.nodes.lock().remove(id);
    }

    /// Makes `id` accept or refuse new streams.
    pub fn set_reachable(&self, id: &PeerId, reachable: bool) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            node.reachable = reachable;
        }
    }

    /// Peers registered under `namespace`, sorted.
    pub fn members(&self, namespace: &str) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .nodes
            .lock()
            .iter()
            .filter(|(_, node)| node.namespace == namespace)
            .map(|(id, _)| id.clone())
            .collect();
        members.sort();
        members
    }

    fn inbound(&self, id: &PeerId) -> Option<InboundHandle> {
        let nodes = self.nodes.lock();
        let node = nodes.get(id)?;
        if node.reachable {
            node.inbound.clone()
        } else {
            None
        }
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// This node's ID.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Routes inbound streams for this node to `handle`.
    pub fn attach(&self, handle: InboundHandle) {
        if let Some(node) = self.network.nodes.lock().get_mut(&self.id) {
            node.inbound = Some(handle);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn host_identity(&self) -> Result<PeerId, TransportError> {
        Ok(self.id.clone())
    }

    async fn open_stream(&self, peer: &PeerId, _protocol: &str) -> Result<BoxedStream, TransportError> {
        if *peer == self.id {
            return Err(TransportError::Connect {
                peer: peer.clone(),
                reason: "cannot dial self".into(),
            });
        }

        let inbound = self
            .network
            .inbound(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        inbound
            .accept(self.id.clone(), Box::new(remote))
            .await
            .map_err(|e| TransportError::Connect {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(local))
    }
}

#[async_trait]
impl Discovery for MemoryTransport {
    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerId>, TransportError> {
        Ok(self.network.members(namespace))
    }
}
