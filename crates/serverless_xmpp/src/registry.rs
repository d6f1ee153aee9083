//! Connection registry — which streams exist for which peer.
//!
//! Each peer identity has at most one outgoing (we dialed) and one ingoing
//! (they dialed) stream. Outgoing creation is serialized per identity, so
//! concurrent callers share a single dial. Accepted connections sit in a
//! pending set until their stream-open names the remote peer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::directory::PeerDirectory;
use crate::element::Stanza;
use crate::error::LinkError;
use crate::event::{EventBus, InboundStanza, LinkEvent};
use crate::identity::PeerIdentity;
use crate::presence::PeerRecord;
use crate::reply::ReplyCollector;
use crate::stream::{Stream, StreamId, StreamObserver, StreamOptions, StreamRole, StreamState};
use crate::transport::{Channel, Transport};

#[derive(Debug, Default)]
struct RegistryEntry {
    outgoing: Option<Arc<Stream>>,
    ingoing: Option<Arc<Stream>>,
}

impl RegistryEntry {
    fn is_empty(&self) -> bool {
        self.outgoing.is_none() && self.ingoing.is_none()
    }
}

/// Slot occupancy for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    pub outgoing: usize,
    pub ingoing: usize,
}

/// Tracks every stream the service owns.
pub struct ConnectionRegistry {
    me: Weak<ConnectionRegistry>,
    config: LinkConfig,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn Transport>,
    replies: Arc<ReplyCollector>,
    events: EventBus,
    entries: Mutex<HashMap<PeerIdentity, RegistryEntry>>,
    pending_incoming: Mutex<HashMap<StreamId, Arc<Stream>>>,
    dial_locks: Mutex<HashMap<PeerIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(
        config: LinkConfig,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        replies: Arc<ReplyCollector>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            directory,
            transport,
            replies,
            events,
            entries: Mutex::new(HashMap::new()),
            pending_incoming: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
        })
    }

    fn observer(&self) -> Weak<dyn StreamObserver> {
        self.me.clone()
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            reply_timeout: self.config.reply_timeout,
            compression_methods: if self.config.compression_enabled {
                self.config.compression_methods.clone()
            } else {
                Vec::new()
            },
        }
    }

    fn dial_lock(&self, identity: &PeerIdentity) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.dial_locks
                .lock()
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn release_dial_lock(&self, identity: &PeerIdentity) {
        let mut locks = self.dial_locks.lock();
        if locks.get(identity).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(identity);
        }
    }

    /// The outgoing stream for `identity` if its channel is still open.
    /// A dead one is evicted on the way.
    fn live_outgoing(&self, identity: &PeerIdentity) -> Option<Arc<Stream>> {
        let existing = self
            .entries
            .lock()
            .get(identity)
            .and_then(|e| e.outgoing.clone())?;
        if existing.is_open() {
            return Some(existing);
        }
        debug!("Evicting dead outgoing stream {} to {identity}", existing.id());
        self.remove(&existing);
        None
    }

    /// Return the outgoing stream to `identity`, dialing it if necessary.
    ///
    /// Concurrent callers for the same identity share one dial and receive
    /// the same stream. Fails with `NotConnected` if the peer is unknown or
    /// unreachable and with `NoResponse` if the handshake stalls. A failed
    /// or abandoned attempt leaves no registry slot behind.
    pub async fn get_or_create_outgoing(
        &self,
        identity: &PeerIdentity,
    ) -> Result<Arc<Stream>, LinkError> {
        // A stream still mid-handshake belongs to another caller's dial; wait
        // for it on the lock below.
        if let Some(stream) = self
            .live_outgoing(identity)
            .filter(|s| s.state().is_established())
        {
            return Ok(stream);
        }
        if self.directory.get(identity).is_none() {
            return Err(LinkError::not_connected(format!("Unknown user: {identity}")));
        }

        let lock = self.dial_lock(identity);
        let result = {
            let _dialing = lock.lock().await;
            match self.live_outgoing(identity) {
                Some(stream) => Ok(stream),
                None => self.dial(identity).await,
            }
        };
        drop(lock);
        self.release_dial_lock(identity);
        result
    }

    async fn dial(&self, identity: &PeerIdentity) -> Result<Arc<Stream>, LinkError> {
        // Re-read: the record may have changed while we waited for the lock.
        let Some(record) = self.directory.get(identity) else {
            return Err(LinkError::not_connected(format!("Unknown user: {identity}")));
        };
        let channel = self.connect_any(&record).await?;

        let stream = Stream::spawn(
            channel,
            StreamRole::Initiator,
            self.directory.local_identity(),
            Some(identity.clone()),
            self.stream_options(),
            self.observer(),
        );
        self.entries
            .lock()
            .entry(identity.clone())
            .or_default()
            .outgoing = Some(Arc::clone(&stream));

        let mut pending = PendingOutgoing {
            registry: self,
            stream: &stream,
            armed: true,
        };

        stream.open_stream()?;
        stream.wait_active(self.config.reply_timeout).await?;

        if self.config.compression_enabled {
            match stream
                .negotiate_compression(&self.config.compression_methods)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    debug!("Continuing uncompressed to {identity}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        pending.armed = false;
        drop(pending);
        info!(
            "Outgoing stream {} to {identity} ready (compressed: {})",
            stream.id(),
            stream.is_compression_active()
        );
        self.events.publish(LinkEvent::StreamReady {
            peer: identity.clone(),
            stream: stream.id(),
            role: StreamRole::Initiator,
            compressed: stream.is_compression_active(),
        });
        Ok(stream)
    }

    /// Try each known host of `record` in order.
    async fn connect_any(&self, record: &PeerRecord) -> Result<Channel, LinkError> {
        let mut last_error = None;
        for host in &record.hosts {
            match self.transport.connect(host, record.port).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    debug!("Dial {host}:{} for {} failed: {e}", record.port, record.identity);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            LinkError::not_connected(format!("No address known for {}", record.identity))
        }))
    }

    /// Take ownership of an accepted channel.
    ///
    /// The stream stays pending until its stream-open names a known peer,
    /// at which point it moves into that peer's ingoing slot.
    pub fn register_incoming(&self, channel: Channel) -> Arc<Stream> {
        let (stream, tasks) = Stream::prepare(
            channel,
            StreamRole::Responder,
            self.directory.local_identity(),
            None,
            self.stream_options(),
            self.observer(),
        );
        self.pending_incoming
            .lock()
            .insert(stream.id(), Arc::clone(&stream));
        tasks.start();
        debug!("Registered incoming stream {} from {}", stream.id(), stream.remote_addr());
        stream
    }

    /// Drop `stream` from whichever slot holds it. Idempotent.
    pub fn remove(&self, stream: &Stream) -> bool {
        let was_pending = self.pending_incoming.lock().remove(&stream.id()).is_some();
        let Some(peer) = stream.peer() else {
            return was_pending;
        };

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&peer) else {
            return was_pending;
        };
        let mut removed = false;
        if entry.outgoing.as_ref().is_some_and(|s| s.id() == stream.id()) {
            entry.outgoing = None;
            removed = true;
        }
        if entry.ingoing.as_ref().is_some_and(|s| s.id() == stream.id()) {
            entry.ingoing = None;
            removed = true;
        }
        if entry.is_empty() {
            entries.remove(&peer);
        }
        if removed {
            debug!("Removed stream {} for {peer}", stream.id());
        }
        removed || was_pending
    }

    /// Close and forget every stream to `identity`.
    pub fn disconnect(&self, identity: &PeerIdentity) {
        let entry = self.entries.lock().remove(identity);
        if let Some(entry) = entry {
            for stream in entry.outgoing.into_iter().chain(entry.ingoing) {
                stream.close_channel();
            }
        }
    }

    pub fn outgoing(&self, identity: &PeerIdentity) -> Option<Arc<Stream>> {
        self.entries
            .lock()
            .get(identity)
            .and_then(|e| e.outgoing.clone())
    }

    pub fn ingoing(&self, identity: &PeerIdentity) -> Option<Arc<Stream>> {
        self.entries
            .lock()
            .get(identity)
            .and_then(|e| e.ingoing.clone())
    }

    /// Every registered stream to `identity`, outgoing first.
    pub fn streams_for(&self, identity: &PeerIdentity) -> Vec<Arc<Stream>> {
        self.entries
            .lock()
            .get(identity)
            .map(|e| e.outgoing.iter().chain(e.ingoing.iter()).cloned().collect())
            .unwrap_or_default()
    }

    /// A stream that can carry traffic to `identity` right now.
    ///
    /// Prefers an `Active` stream (outgoing first) and falls back to one
    /// still in `AwaitingFeatures`.
    pub fn routable_stream(&self, identity: &PeerIdentity) -> Option<Arc<Stream>> {
        let candidates = self.streams_for(identity);
        candidates
            .iter()
            .find(|s| s.state() == StreamState::Active)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|s| s.state() == StreamState::AwaitingFeatures)
            })
            .cloned()
    }

    /// All registered streams, including unidentified incoming ones.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        let mut all: Vec<Arc<Stream>> = self
            .entries
            .lock()
            .values()
            .flat_map(|e| e.outgoing.iter().chain(e.ingoing.iter()).cloned())
            .collect();
        all.extend(self.pending_incoming.lock().values().cloned());
        all
    }

    pub fn slot_counts(&self, identity: &PeerIdentity) -> SlotCounts {
        self.entries
            .lock()
            .get(identity)
            .map(|e| SlotCounts {
                outgoing: usize::from(e.outgoing.is_some()),
                ingoing: usize::from(e.ingoing.is_some()),
            })
            .unwrap_or(SlotCounts {
                outgoing: 0,
                ingoing: 0,
            })
    }

    /// Number of identities with at least one stream.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn pending_incoming_count(&self) -> usize {
        self.pending_incoming.lock().len()
    }

    /// Close every stream and empty the registry.
    pub fn close_all(&self) {
        let streams = self.streams();
        self.entries.lock().clear();
        self.pending_incoming.lock().clear();
        for stream in streams {
            stream.close_channel();
        }
    }

    /// Send `stanza` to `identity` over its outgoing stream, dialing first
    /// if needed.
    pub async fn send_to(&self, identity: &PeerIdentity, stanza: Stanza) -> Result<(), LinkError> {
        let stream = self.get_or_create_outgoing(identity).await?;
        stream.send(stanza).await
    }
}

impl StreamObserver for ConnectionRegistry {
    fn identify(&self, stream: &Arc<Stream>, remote: &PeerIdentity) -> bool {
        self.pending_incoming.lock().remove(&stream.id());
        if !self.directory.contains(remote) {
            warn!("Incoming stream {} from unknown peer {remote}", stream.id());
            return false;
        }

        let replaced = self
            .entries
            .lock()
            .entry(remote.clone())
            .or_default()
            .ingoing
            .replace(Arc::clone(stream));
        if let Some(old) = replaced {
            if old.id() != stream.id() {
                info!(
                    "Incoming stream {} replaces {} for {remote}",
                    stream.id(),
                    old.id()
                );
                old.close_channel();
            }
        }
        true
    }

    fn incoming_ready(&self, stream: &Arc<Stream>) {
        let Some(peer) = stream.peer() else {
            return;
        };
        info!("Incoming stream {} from {peer} ready", stream.id());
        self.events.publish(LinkEvent::StreamReady {
            peer,
            stream: stream.id(),
            role: StreamRole::Responder,
            compressed: stream.is_compression_active(),
        });
    }

    fn stanza_received(&self, stream: &Arc<Stream>, mut stanza: Stanza) {
        let Some(peer) = stream.peer() else {
            return;
        };
        if stanza.from.is_none() {
            stanza.from = Some(peer.clone());
        }
        if let Some(stanza) = self.replies.offer(&peer, stanza) {
            self.events.deliver(InboundStanza {
                peer,
                stream: Some(stream.id()),
                stanza,
            });
        }
    }

    fn stream_terminated(&self, stream: &Arc<Stream>, fault: Option<LinkError>) {
        self.remove(stream);
        let peer = stream.peer();
        if let Some(fault) = fault {
            self.events.publish(LinkEvent::ProtocolFault {
                peer: peer.clone(),
                stream: stream.id(),
                reason: fault.to_string(),
            });
        }
        self.events.publish(LinkEvent::StreamClosed {
            peer,
            stream: stream.id(),
        });
    }
}

/// Rolls back a half-built outgoing stream unless disarmed.
struct PendingOutgoing<'a> {
    registry: &'a ConnectionRegistry,
    stream: &'a Arc<Stream>,
    armed: bool,
}

impl Drop for PendingOutgoing<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Rolling back outgoing stream {}", self.stream.id());
            self.stream.close_channel();
            self.registry.remove(self.stream);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::element::{IqPayload, IqType, StreamFeatures};
    use crate::test_support::{FakePeer, MemoryTransport, spawn_auto_responder};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        directory: Arc<PeerDirectory>,
        transport: MemoryTransport,
        events: EventBus,
    }

    fn fixture(config: LinkConfig) -> Fixture {
        let events = EventBus::new(64);
        let local = PeerRecord::new(PeerIdentity::from("me@h"), vec![], 2300);
        let directory = Arc::new(PeerDirectory::new(local, events.clone()));
        let transport = MemoryTransport::new();
        let registry = ConnectionRegistry::new(
            config,
            Arc::clone(&directory),
            Arc::new(transport.clone()),
            Arc::new(ReplyCollector::new()),
            events.clone(),
        );
        Fixture {
            registry,
            directory,
            transport,
            events,
        }
    }

    fn quick_config() -> LinkConfig {
        LinkConfig {
            reply_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        }
    }

    impl Fixture {
        fn discover(&self, name: &str, host: &str, port: u16) -> PeerIdentity {
            let identity = PeerIdentity::from(name);
            self.directory
                .resolved(identity.clone(), vec![host.into()], port, &BTreeMap::new());
            identity
        }

        fn serve(&self, identity: &PeerIdentity, host: &str, port: u16, features: StreamFeatures) {
            spawn_auto_responder(
                self.transport.listen_at(host, port),
                identity.clone(),
                features,
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_connected() {
        let f = fixture(quick_config());
        let err = f
            .registry
            .get_or_create_outgoing(&PeerIdentity::from("ghost@h"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
        assert_eq!(f.transport.connect_count(), 0);
        assert_eq!(f.registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_alice_scenario() {
        let f = fixture(quick_config());
        let alice = f.discover("alice", "H", 5000);
        let mut listener = f.transport.listen_at("H", 5000);

        let registry = Arc::clone(&f.registry);
        let dial = {
            let alice = alice.clone();
            tokio::spawn(async move { registry.get_or_create_outgoing(&alice).await })
        };

        let channel = listener.accept().await.unwrap();
        let mut peer = FakePeer::wrap(alice.clone(), channel.into_io());
        let header = peer.expect_open().await;
        assert_eq!(header.to, Some(alice.clone()));
        peer.accept_versioned(StreamFeatures::default()).await;

        let stream = dial.await.unwrap().unwrap();
        assert_eq!(stream.state(), StreamState::Active);
        assert!(!stream.is_compression_active());
        assert_eq!(f.transport.connect_count(), 1);
        assert_eq!(
            f.registry.slot_counts(&alice),
            SlotCounts {
                outgoing: 1,
                ingoing: 0
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_dial_shares_one_connect() {
        let f = fixture(quick_config());
        let bob = f.discover("bob", "10.0.0.2", 5001);
        f.serve(&bob, "10.0.0.2", 5001, StreamFeatures::default());
        f.transport.set_connect_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            f.registry.get_or_create_outgoing(&bob),
            f.registry.get_or_create_outgoing(&bob)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.transport.connect_count(), 1);
        assert_eq!(f.registry.slot_counts(&bob).outgoing, 1);
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_handshake() {
        let f = fixture(LinkConfig {
            reply_timeout: Duration::from_secs(2),
            ..LinkConfig::default()
        });
        let bob = f.discover("bob", "h", 5010);
        let mut listener = f.transport.listen_at("h", 5010);

        let first = {
            let registry = Arc::clone(&f.registry);
            let bob = bob.clone();
            tokio::spawn(async move { registry.get_or_create_outgoing(&bob).await })
        };
        let channel = listener.accept().await.unwrap();
        let mut peer = FakePeer::wrap(bob.clone(), channel.into_io());
        peer.expect_open().await;
        let dialing = f.registry.outgoing(&bob).unwrap();
        assert!(!dialing.state().is_established());

        // Arrives after the connect, before the features.
        let second = {
            let registry = Arc::clone(&f.registry);
            let bob = bob.clone();
            tokio::spawn(async move { registry.get_or_create_outgoing(&bob).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        peer.accept_versioned(StreamFeatures::default()).await;
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.state(), StreamState::Active);
        assert_eq!(f.transport.connect_count(), 1);
        b.send(Stanza::message(bob.clone(), "after handshake"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_compression_fallback_reaches_active() {
        let f = fixture(LinkConfig {
            compression_enabled: true,
            ..quick_config()
        });
        let carol = f.discover("carol", "h", 5002);
        f.serve(&carol, "h", 5002, StreamFeatures::default());

        let stream = f.registry.get_or_create_outgoing(&carol).await.unwrap();
        assert_eq!(stream.state(), StreamState::Active);
        assert!(!stream.is_compression_active());
    }

    #[tokio::test]
    async fn test_handshake_timeout_rolls_back() {
        let f = fixture(LinkConfig {
            reply_timeout: Duration::from_millis(100),
            ..LinkConfig::default()
        });
        let dave = f.discover("dave", "h", 5003);
        // Accept the connection but never answer.
        let mut listener = f.transport.listen_at("h", 5003);
        let holder = tokio::spawn(async move {
            let channel = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(channel);
        });

        let err = f.registry.get_or_create_outgoing(&dave).await.unwrap_err();
        assert!(matches!(err, LinkError::NoResponse(_)));
        assert_eq!(f.registry.entry_count(), 0);
        holder.abort();
    }

    #[tokio::test]
    async fn test_cancelled_dial_leaves_no_slot() {
        let f = fixture(quick_config());
        let erin = f.discover("erin", "h", 5004);
        let mut listener = f.transport.listen_at("h", 5004);
        let _holder = tokio::spawn(async move {
            let _channel = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            f.registry.get_or_create_outgoing(&erin),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(f.registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_outgoing_is_replaced() {
        let f = fixture(quick_config());
        let bob = f.discover("bob", "h", 5005);
        f.serve(&bob, "h", 5005, StreamFeatures::default());

        let first = f.registry.get_or_create_outgoing(&bob).await.unwrap();
        first.close_channel();
        let second = f.registry.get_or_create_outgoing(&bob).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(f.registry.slot_counts(&bob).outgoing, 1);
        assert_eq!(f.transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_incoming_promoted_and_replaced() {
        let f = fixture(quick_config());
        let alice = f.discover("alice@h", "h", 5006);
        let mut events = f.events.subscribe();

        let (channel, mut first_peer) = FakePeer::pair_as(alice.clone());
        let first = f.registry.register_incoming(channel);
        assert_eq!(f.registry.pending_incoming_count(), 1);
        first_peer.open_to(&PeerIdentity::from("me@h")).await;
        first.wait_active(Duration::from_secs(1)).await.unwrap();
        assert_eq!(f.registry.pending_incoming_count(), 0);
        assert_eq!(f.registry.slot_counts(&alice).ingoing, 1);

        let (channel, mut second_peer) = FakePeer::pair_as(alice.clone());
        let second = f.registry.register_incoming(channel);
        second_peer.open_to(&PeerIdentity::from("me@h")).await;
        second.wait_active(Duration::from_secs(1)).await.unwrap();

        assert_eq!(f.registry.slot_counts(&alice).ingoing, 1);
        assert_eq!(f.registry.ingoing(&alice).unwrap().id(), second.id());
        assert!(first.state().is_shutting_down());

        let ready = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(LinkEvent::StreamReady { role, .. }) = events.recv().await {
                    return role;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ready, StreamRole::Responder);
    }

    #[tokio::test]
    async fn test_incoming_from_unknown_peer_rejected() {
        let f = fixture(quick_config());
        let (channel, mut peer) = FakePeer::pair_as(PeerIdentity::from("mallory@h"));
        let stream = f.registry.register_incoming(channel);
        peer.open_to(&PeerIdentity::from("me@h")).await;

        let mut rx = stream.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == StreamState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.registry.entry_count(), 0);
        assert_eq!(f.registry.pending_incoming_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let f = fixture(quick_config());
        let bob = f.discover("bob", "h", 5007);
        f.serve(&bob, "h", 5007, StreamFeatures::default());

        let stream = f.registry.get_or_create_outgoing(&bob).await.unwrap();
        assert!(f.registry.remove(&stream));
        assert!(!f.registry.remove(&stream));
        assert_eq!(f.registry.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_dual_role_streams_are_distinct() {
        let f = fixture(quick_config());
        let bob = f.discover("bob@h", "h", 5008);
        f.serve(&bob, "h", 5008, StreamFeatures::default());

        let outgoing = f.registry.get_or_create_outgoing(&bob).await.unwrap();
        let (channel, mut peer) = FakePeer::pair_as(bob.clone());
        let ingoing = f.registry.register_incoming(channel);
        peer.open_to(&PeerIdentity::from("me@h")).await;
        ingoing.wait_active(Duration::from_secs(1)).await.unwrap();

        assert_ne!(outgoing.id(), ingoing.id());
        assert_eq!(
            f.registry.slot_counts(&bob),
            SlotCounts {
                outgoing: 1,
                ingoing: 1
            }
        );
        assert_eq!(f.registry.streams_for(&bob).len(), 2);
        assert_eq!(
            f.registry.routable_stream(&bob).unwrap().id(),
            outgoing.id()
        );

        // A round trip through the auto-responder.
        let request = Stanza::iq(Some(bob.clone()), IqType::Get, IqPayload::Empty);
        f.registry.send_to(&bob, request).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let f = fixture(quick_config());
        let bob = f.discover("bob", "h", 5009);
        f.serve(&bob, "h", 5009, StreamFeatures::default());
        let stream = f.registry.get_or_create_outgoing(&bob).await.unwrap();

        f.registry.close_all();
        assert_eq!(f.registry.entry_count(), 0);
        assert_eq!(stream.state(), StreamState::Closed);
        let err = stream
            .send(Stanza::message(bob.clone(), "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
    }
}
