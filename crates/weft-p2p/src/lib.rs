//! # Weft P2P
//!
//! Peer overlay for Weft.
//!
//! The overlay keeps a live set of peer sessions on top of a pluggable
//! transport and discovery substrate, keeps them alive with ping/pong, and
//! routes application messages to one peer or to everyone. Gossip messages
//! flood the overlay and are relayed at most once per node.
//!
//! Three kinds of task cooperate, talking only through channels:
//!
//! - one session task per connected peer,
//! - the peer manager, which owns the session directory and reconciles it
//!   against discovery,
//! - the request router, which delivers outbound requests and runs the
//!   gossip check for inbound ones.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft_p2p::memory::MemoryNetwork;
//! use weft_p2p::{Message, Overlay, OverlayConfig, PeerId};
//!
//! # async fn run() -> weft_p2p::Result<()> {
//! let network = MemoryNetwork::new();
//! let transport = Arc::new(network.join("alice", "chat"));
//!
//! let overlay = Overlay::builder(OverlayConfig::new("chat"), transport.clone())
//!     .discovery(transport.clone())
//!     .observer(|peer: &PeerId, message: &Message| println!("{peer}: {message:?}"))
//!     .build()?;
//! transport.attach(overlay.inbound_handle());
//!
//! overlay.broadcast(Message::gossip(0, "hello")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod dedup;
mod error;
mod manager;
pub mod memory;
pub mod observability;
mod overlay;
mod peer;
mod router;
mod session;
mod transport;

pub use config::OverlayConfig;
pub use error::{P2pError, Result, TransportError};
pub use overlay::{MessageObserver, Overlay, OverlayBuilder};
pub use peer::{PeerId, SessionId};
pub use router::{DeliveryFailure, FailureReason, PeerView, Target, MAX_ATTEMPTS};
pub use session::{SessionHandle, OUTBOUND_SEND_TIMEOUT};
pub use transport::{BoxedStream, Discovery, DiscoverySink, ExitSignal, InboundHandle, Stream, Transport};
pub use weft_protocol::{Message, MessageCodec, MessageId, WireCodec, MAX_MESSAGE_SIZE};
