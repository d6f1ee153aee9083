//! Serverless XMPP — link-local messaging without a server.
//!
//! Peers find each other through a discovery backend (multicast DNS on a
//! real network, or the in-process [`MemoryDiscoveryHub`]) and talk over
//! direct streams, one per direction per peer.
//!
//! # Architecture
//!
//! - **Directory**: discovered presence records keyed by peer identity.
//! - **Streams**: one task pair per connection running the stream-open,
//!   features and optional zlib compression handshake.
//! - **Registry**: at most one outgoing and one ingoing stream per peer,
//!   dialed on demand and reaped when idle.
//! - **Router**: sends application stanzas and answers roster, disco#info
//!   and presence queries locally.
//! - **Replies**: request/response correlation across every stream to a peer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serverless_xmpp::{LinkConfig, LinkService, MemoryDiscoveryHub, PeerIdentity, PeerRecord, Stanza};
//!
//! # async fn example() -> Result<(), serverless_xmpp::LinkError> {
//! let hub = MemoryDiscoveryHub::new();
//! let local = PeerRecord::new(PeerIdentity::from("alice@laptop"), vec![], 0);
//! let mut service = LinkService::with_tcp(LinkConfig::default(), local, Arc::new(hub.endpoint()));
//!
//! service.start().await?;
//! service.send(Stanza::message(PeerIdentity::from("bob@desktop"), "hi")).await?;
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod element;
pub mod error;
pub mod event;
pub mod identity;
pub mod logging;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod reply;
pub mod router;
pub mod service;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod test_support;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::LinkConfig;
pub use directory::PeerDirectory;
pub use discovery::{DiscoveryBackend, MemoryDiscovery, MemoryDiscoveryHub};
pub use element::{Element, IqPayload, IqType, Stanza, StanzaKind};
pub use error::LinkError;
pub use event::{InboundStanza, LinkEvent};
pub use identity::PeerIdentity;
pub use presence::{PeerRecord, PresenceStatus};
pub use registry::ConnectionRegistry;
pub use reply::{ReplyCollector, ReplyFilter};
pub use router::StanzaRouter;
pub use service::LinkService;
pub use stream::{Stream, StreamId, StreamRole, StreamState};
pub use transport::{TcpTransport, Transport};
