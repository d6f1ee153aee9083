//! In-memory fixtures shared by the unit tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::ElementCodec;
use crate::element::{Element, STREAM_VERSION, Stanza, StreamFeatures, StreamHeader};
use crate::error::LinkError;
use crate::identity::PeerIdentity;
use crate::stream::{Stream, StreamObserver, StreamOptions};
use crate::transport::{Acceptor, ByteStream, Channel, Transport};

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

pub fn stream_pair_options(methods: &[&str]) -> StreamOptions {
    StreamOptions {
        reply_timeout: Duration::from_secs(2),
        compression_methods: methods.iter().map(|m| m.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Scripted peer
// ---------------------------------------------------------------------------

/// The far end of an in-memory channel, driven element by element.
pub struct FakePeer {
    identity: PeerIdentity,
    framed: Framed<Box<dyn ByteStream>, ElementCodec>,
}

impl FakePeer {
    /// A channel for the stream under test and the scripted peer "alice@h".
    pub fn pair() -> (Channel, FakePeer) {
        Self::pair_as(PeerIdentity::from("alice@h"))
    }

    pub fn pair_as(identity: PeerIdentity) -> (Channel, FakePeer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (Channel::new(ours, "memory"), Self::wrap(identity, Box::new(theirs)))
    }

    pub fn wrap(identity: PeerIdentity, io: Box<dyn ByteStream>) -> FakePeer {
        FakePeer {
            identity,
            framed: Framed::new(io, ElementCodec::new().with_label("fake")),
        }
    }

    pub async fn send(&mut self, element: Element) {
        self.framed.send(element).await.unwrap();
    }

    /// The next element, failing the test if none arrives in time.
    pub async fn next(&mut self) -> Element {
        tokio::time::timeout(STEP_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for element")
            .expect("channel closed")
            .expect("decode failed")
    }

    /// The next element, or `None` if nothing arrives within `wait`.
    pub async fn try_next(&mut self, wait: Duration) -> Option<Element> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(element))) => Some(element),
            _ => None,
        }
    }

    pub async fn expect_open(&mut self) -> StreamHeader {
        match self.next().await {
            Element::StreamOpen(header) => header,
            other => panic!("expected stream-open, got {other:?}"),
        }
    }

    /// Answer an initiator's stream-open as a versioned responder.
    pub async fn accept_versioned(&mut self, features: StreamFeatures) {
        self.send(Element::StreamOpen(StreamHeader {
            to: None,
            from: Some(self.identity.clone()),
            version: Some(STREAM_VERSION.into()),
            id: Some("fake".into()),
        }))
        .await;
        self.send(Element::Features(features)).await;
    }

    /// Open a stream towards a responder under test.
    pub async fn open_to(&mut self, to: &PeerIdentity) {
        self.send(Element::StreamOpen(StreamHeader {
            to: Some(to.clone()),
            from: Some(self.identity.clone()),
            version: Some(STREAM_VERSION.into()),
            id: None,
        }))
        .await;
    }

    pub async fn expect_stanza(&mut self) -> Stanza {
        loop {
            match self.next().await {
                Element::Stanza(stanza) => return stanza,
                Element::StreamOpen(_) | Element::Features(_) => continue,
                other => panic!("expected stanza, got {other:?}"),
            }
        }
    }
}

/// Accept every channel on `acceptor` and answer the handshake with
/// `features`, then echo each IQ request back as a result.
pub fn spawn_auto_responder(
    mut acceptor: Box<dyn Acceptor>,
    identity: PeerIdentity,
    features: StreamFeatures,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(channel) = acceptor.accept().await {
            let identity = identity.clone();
            let features = features.clone();
            tokio::spawn(async move {
                let mut peer = FakePeer::wrap(identity, channel.into_io());
                if !matches!(peer.framed.next().await, Some(Ok(Element::StreamOpen(_)))) {
                    return;
                }
                peer.accept_versioned(features).await;
                while let Some(Ok(element)) = peer.framed.next().await {
                    match element {
                        Element::Stanza(stanza) if stanza.is_request() => {
                            let reply =
                                stanza.result_reply(crate::element::IqPayload::Empty);
                            peer.send(Element::Stanza(reply)).await;
                        }
                        Element::StreamClose { .. } => {
                            peer.send(Element::stream_close()).await;
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    })
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Observer that records what a stream reports.
pub struct RecordingObserver {
    accept: bool,
    stanzas_tx: mpsc::UnboundedSender<Stanza>,
    stanzas_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stanza>>,
    terminated_tx: mpsc::UnboundedSender<Option<LinkError>>,
    terminated_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<LinkError>>>,
}

impl RecordingObserver {
    fn new(accept: bool) -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
        Self {
            accept,
            stanzas_tx,
            stanzas_rx: tokio::sync::Mutex::new(stanzas_rx),
            terminated_tx,
            terminated_rx: tokio::sync::Mutex::new(terminated_rx),
        }
    }

    pub fn accepting() -> Self {
        Self::new(true)
    }

    pub fn rejecting() -> Self {
        Self::new(false)
    }

    pub async fn next_stanza(&self) -> Stanza {
        let mut rx = self.stanzas_rx.lock().await;
        tokio::time::timeout(STEP_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for stanza")
            .expect("observer dropped")
    }

    pub async fn wait_terminated(&self) -> Option<LinkError> {
        let mut rx = self.terminated_rx.lock().await;
        tokio::time::timeout(STEP_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for termination")
            .expect("observer dropped")
    }
}

impl StreamObserver for RecordingObserver {
    fn identify(&self, _stream: &Arc<Stream>, _remote: &PeerIdentity) -> bool {
        self.accept
    }

    fn incoming_ready(&self, _stream: &Arc<Stream>) {}

    fn stanza_received(&self, _stream: &Arc<Stream>, stanza: Stanza) {
        let _ = self.stanzas_tx.send(stanza);
    }

    fn stream_terminated(&self, _stream: &Arc<Stream>, fault: Option<LinkError>) {
        let _ = self.terminated_tx.send(fault);
    }
}

// ---------------------------------------------------------------------------
// Memory transport
// ---------------------------------------------------------------------------

/// In-process network of listeners keyed by `host:port`.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Channel>>>>,
    connects: Arc<AtomicUsize>,
    connect_delay: Arc<Mutex<Duration>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `connect` calls that reached a listener.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Slow every connect down, to widen race windows.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Register a listener at `host:port` directly.
    pub fn listen_at(&self, host: &str, port: u16) -> Box<dyn Acceptor> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(format!("{host}:{port}"), tx);
        Box::new(MemoryAcceptor { port, rx })
    }
}

struct MemoryAcceptor {
    port: u16,
    rx: mpsc::UnboundedReceiver<Channel>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<Channel, LinkError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| LinkError::not_connected("listener closed"))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(
        &self,
        _bind: Option<IpAddr>,
        min: u16,
        max: u16,
    ) -> Result<Box<dyn Acceptor>, LinkError> {
        let free = (min..=max).find(|port| {
            !self
                .listeners
                .lock()
                .contains_key(&format!("127.0.0.1:{port}"))
        });
        match free {
            Some(port) => Ok(self.listen_at("127.0.0.1", port)),
            None => Err(LinkError::BindExhausted { min, max }),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Channel, LinkError> {
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let key = format!("{host}:{port}");
        let listener = self
            .listeners
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| LinkError::not_connected(format!("connection refused: {key}")))?;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        listener
            .send(Channel::new(theirs, "memory"))
            .map_err(|_| LinkError::not_connected(format!("connection refused: {key}")))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Channel::new(ours, key))
    }
}
