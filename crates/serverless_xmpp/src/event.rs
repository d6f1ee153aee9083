//! Connection-state events and the inbound stanza feed.

use tokio::sync::broadcast;

use crate::element::Stanza;
use crate::identity::PeerIdentity;
use crate::stream::{StreamId, StreamRole};

/// Lifecycle events observable by the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A peer appeared in, or changed content in, the directory.
    PeerAdded(PeerIdentity),
    PeerRemoved(PeerIdentity),
    /// A stream finished its handshake.
    StreamReady {
        peer: PeerIdentity,
        stream: StreamId,
        role: StreamRole,
        compressed: bool,
    },
    StreamClosed {
        peer: Option<PeerIdentity>,
        stream: StreamId,
    },
    /// A reader task tore its stream down on a protocol violation.
    ProtocolFault {
        peer: Option<PeerIdentity>,
        stream: StreamId,
        reason: String,
    },
}

/// An application stanza delivered to the local side.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundStanza {
    /// Peer the stanza came from (or is about, for local auto-responses).
    pub peer: PeerIdentity,
    /// Stream the stanza arrived on. `None` for locally synthesized stanzas.
    pub stream: Option<StreamId>,
    pub stanza: Stanza,
}

/// Fan-out of [`LinkEvent`]s and [`InboundStanza`]s to any number of
/// subscribers.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `Lagged` on their receiver.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<LinkEvent>,
    stanzas: broadcast::Sender<InboundStanza>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (stanzas, _) = broadcast::channel(capacity.max(1));
        Self { events, stanzas }
    }

    pub fn publish(&self, event: LinkEvent) {
        tracing::trace!("event: {event:?}");
        let _ = self.events.send(event);
    }

    pub fn deliver(&self, inbound: InboundStanza) {
        let _ = self.stanzas.send(inbound);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_stanzas(&self) -> broadcast::Receiver<InboundStanza> {
        self.stanzas.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(LinkEvent::PeerAdded(PeerIdentity::from("alice@h")));

        assert_eq!(
            a.recv().await.unwrap(),
            LinkEvent::PeerAdded(PeerIdentity::from("alice@h"))
        );
        assert_eq!(
            b.recv().await.unwrap(),
            LinkEvent::PeerAdded(PeerIdentity::from("alice@h"))
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(1);
        bus.publish(LinkEvent::PeerRemoved(PeerIdentity::from("bob@h")));
        bus.deliver(InboundStanza {
            peer: PeerIdentity::from("bob@h"),
            stream: None,
            stanza: Stanza::unavailable(),
        });
    }
}
