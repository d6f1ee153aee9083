//! Stream — one physical connection to or from a peer and its handshake.
//!
//! Each [`Stream`] owns its channel exclusively. The channel is split into a
//! reader task, which decodes elements and drives the handshake, and a
//! writer task, which serializes everything sent on the stream. Senders
//! never touch the socket directly, so a send can never block the reader of
//! the same stream.
//!
//! State lives in a `watch` channel. Every transition goes through
//! [`Stream::advance`], which only applies moves from the transition table
//! in [`StreamState::can_advance_to`]. `Closed` is terminal.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ElementCodec;
use crate::element::{
    COMPRESS_NAMESPACE, Element, STREAM_NAMESPACE, STREAM_VERSION, Stanza, StreamFeatures,
    StreamHeader,
};
use crate::error::LinkError;
use crate::identity::PeerIdentity;
use crate::transport::{ByteStream, Channel};

type ElementSource = FramedRead<ReadHalf<Box<dyn ByteStream>>, ElementCodec>;
type ElementSink = FramedWrite<WriteHalf<Box<dyn ByteStream>>, ElementCodec>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Which side dialed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Initiator,
    Responder,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// Protocol state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Opening,
    AwaitingFeatures,
    Active,
    CompressNegotiating,
    Closing,
    Closed,
}

impl StreamState {
    /// The legal transition table.
    pub fn can_advance_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Opening)
                | (Opening, AwaitingFeatures)
                | (Opening, Active)
                | (AwaitingFeatures, Active)
                | (Active, CompressNegotiating)
                | (CompressNegotiating, Active)
                | (Idle | Opening | AwaitingFeatures | Active | CompressNegotiating, Closing)
                | (Closing, Closed)
        )
    }

    /// `Closing` or `Closed`.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// The opening handshake has finished.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Active | Self::CompressNegotiating)
    }
}

/// Per-stream settings taken from the service configuration.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Bound on send acknowledgements and handshake waits.
    pub reply_timeout: Duration,
    /// Compression methods we advertise as responder. Empty disables it.
    pub compression_methods: Vec<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            compression_methods: Vec::new(),
        }
    }
}

/// Callbacks from a stream's reader task to whoever owns the stream.
///
/// Called from the reader task. Implementations must not block.
pub trait StreamObserver: Send + Sync {
    /// A responder stream learned its remote identity. Returning `false`
    /// rejects the connection and the stream is closed.
    fn identify(&self, stream: &Arc<Stream>, remote: &PeerIdentity) -> bool;

    /// A responder stream finished its side of the handshake.
    fn incoming_ready(&self, stream: &Arc<Stream>);

    fn stanza_received(&self, stream: &Arc<Stream>, stanza: Stanza);

    /// The reader task exited. `fault` is set when it exited on a protocol
    /// violation rather than an orderly close.
    fn stream_terminated(&self, stream: &Arc<Stream>, fault: Option<LinkError>);
}

enum WriteOp {
    Element(Element),
    EnableCompression,
    Close { send_close: bool },
}

struct WriteRequest {
    op: WriteOp,
    ack: Option<oneshot::Sender<Result<(), LinkError>>>,
}

enum Flow {
    Continue,
    Stop,
}

/// One physical connection and its protocol state.
pub struct Stream {
    id: StreamId,
    role: StreamRole,
    local: PeerIdentity,
    peer: RwLock<Option<PeerIdentity>>,
    remote_addr: String,
    state: watch::Sender<StreamState>,
    writer: mpsc::UnboundedSender<WriteRequest>,
    options: StreamOptions,
    remote_features: Mutex<StreamFeatures>,
    compression_active: AtomicBool,
    modern: AtomicBool,
    close_received: AtomicBool,
    last_activity: Mutex<Instant>,
    compress_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    /// Held shared while a stanza is queued and exclusively while the
    /// compression switch is queued, so no plain stanza lands after it.
    send_gate: RwLock<()>,
    cancel: CancellationToken,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &*self.peer.read())
            .field("state", &self.state())
            .field("compressed", &self.is_compression_active())
            .finish()
    }
}

impl Stream {
    /// Take ownership of `channel` and start the reader and writer tasks.
    ///
    /// Initiator streams know their peer up front. Responder streams learn it
    /// from the remote stream-open element.
    pub fn spawn(
        channel: Channel,
        role: StreamRole,
        local: PeerIdentity,
        peer: Option<PeerIdentity>,
        options: StreamOptions,
        observer: Weak<dyn StreamObserver>,
    ) -> Arc<Stream> {
        let (stream, tasks) = Self::prepare(channel, role, local, peer, options, observer);
        tasks.start();
        stream
    }

    /// Build the stream without starting its tasks, so the caller can
    /// record it before the reader can report anything.
    pub(crate) fn prepare(
        channel: Channel,
        role: StreamRole,
        local: PeerIdentity,
        peer: Option<PeerIdentity>,
        options: StreamOptions,
        observer: Weak<dyn StreamObserver>,
    ) -> (Arc<Stream>, StreamTasks) {
        let id = StreamId::next();
        let remote_addr = channel.remote().to_string();
        let (read_half, write_half) = tokio::io::split(channel.into_io());
        let label = id.to_string();
        let source = FramedRead::new(read_half, ElementCodec::new().with_label(label.clone()));
        let sink = FramedWrite::new(write_half, ElementCodec::new().with_label(label));

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(StreamState::Idle);
        let cancel = CancellationToken::new();

        let stream = Arc::new(Stream {
            id,
            role,
            local,
            peer: RwLock::new(peer),
            remote_addr,
            state,
            writer: writer_tx,
            options,
            remote_features: Mutex::new(StreamFeatures::default()),
            compression_active: AtomicBool::new(false),
            modern: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            compress_waiter: Mutex::new(None),
            send_gate: RwLock::new(()),
            cancel,
        });

        debug!(
            "[{id}] {role} stream created for {}",
            stream.remote_addr
        );
        let tasks = StreamTasks {
            stream: Arc::clone(&stream),
            source,
            sink,
            writer_rx,
            observer,
        };
        (stream, tasks)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// Remote identity, once known.
    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer.read().clone()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Whether the channel can still carry traffic.
    pub fn is_open(&self) -> bool {
        !self.state().is_shutting_down() && !self.cancel.is_cancelled()
    }

    /// True once a compression handshake has completed on this stream.
    pub fn is_compression_active(&self) -> bool {
        self.compression_active.load(Ordering::Acquire)
    }

    /// True when the remote declared the versioned handshake.
    pub fn is_modern_protocol(&self) -> bool {
        self.modern.load(Ordering::Acquire)
    }

    pub fn remote_features(&self) -> StreamFeatures {
        self.remote_features.lock().clone()
    }

    /// Mark the stream as active now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last send or receive.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Apply a transition if the table allows it. Returns whether it applied.
    fn advance(&self, next: StreamState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(prev) => {
                debug!("[{}] state {prev:?} -> {next:?}", self.id);
                true
            }
            None => false,
        }
    }

    fn enqueue(&self, op: WriteOp) -> Result<(), LinkError> {
        self.writer
            .send(WriteRequest { op, ack: None })
            .map_err(|_| LinkError::not_connected(format!("stream {} is closed", self.id)))
    }

    fn enqueue_acked(
        &self,
        element: Element,
    ) -> Result<oneshot::Receiver<Result<(), LinkError>>, LinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer
            .send(WriteRequest {
                op: WriteOp::Element(element),
                ack: Some(ack_tx),
            })
            .map_err(|_| LinkError::not_connected(format!("stream {} is closed", self.id)))?;
        Ok(ack_rx)
    }

    /// Wait for the writer to flush a queued element.
    async fn await_ack(
        &self,
        ack_rx: oneshot::Receiver<Result<(), LinkError>>,
    ) -> Result<(), LinkError> {
        match tokio::time::timeout(self.options.reply_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::not_connected(format!(
                "stream {} closed during send",
                self.id
            ))),
            Err(_) => Err(LinkError::NoResponse(self.options.reply_timeout)),
        }
    }

    fn header_for(&self, to: Option<PeerIdentity>, version: Option<String>) -> Element {
        Element::StreamOpen(StreamHeader {
            to,
            from: Some(self.local.clone()),
            version,
            id: match self.role {
                StreamRole::Responder => Some(self.id.to_string()),
                StreamRole::Initiator => None,
            },
        })
    }

    /// Send our stream-open element. Only the first call on an idle
    /// initiator stream does anything; later calls are no-ops.
    pub fn open_stream(&self) -> Result<(), LinkError> {
        match self.state() {
            StreamState::Idle => {}
            StreamState::Closing | StreamState::Closed => {
                return Err(LinkError::not_connected(format!(
                    "stream {} is closed",
                    self.id
                )));
            }
            _ => return Ok(()),
        }
        if self.role == StreamRole::Responder {
            return Err(LinkError::protocol(
                "responder streams open in reply to the remote stream-open",
            ));
        }
        let Some(peer) = self.peer() else {
            return Err(LinkError::protocol("initiator stream without a peer"));
        };
        if !self.advance(StreamState::Opening) {
            // Lost a race with a concurrent open or close.
            return if self.is_open() {
                Ok(())
            } else {
                Err(LinkError::not_connected(format!("stream {} is closed", self.id)))
            };
        }
        self.enqueue(WriteOp::Element(
            self.header_for(Some(peer), Some(STREAM_VERSION.to_string())),
        ))
    }

    /// Wait until the handshake reaches `Active`.
    pub async fn wait_active(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut rx = self.subscribe_state();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, StreamState::Active) || s.is_shutting_down()),
        )
        .await;
        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => StreamState::Closed,
            Err(_) => return Err(LinkError::NoResponse(timeout)),
        };
        if state.is_shutting_down() {
            Err(LinkError::not_connected(format!(
                "stream {} closed during handshake",
                self.id
            )))
        } else {
            Ok(())
        }
    }

    /// Send an application stanza.
    ///
    /// Waits out an in-flight compression handshake. Fails with
    /// `NotConnected` if the stream is closed or closes mid-send.
    pub async fn send(&self, stanza: Stanza) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.options.reply_timeout;
        let mut rx = self.subscribe_state();
        let ack = loop {
            match tokio::time::timeout_at(
                deadline,
                rx.wait_for(|s| *s != StreamState::CompressNegotiating),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    return Err(LinkError::not_connected(format!(
                        "stream {} is closed",
                        self.id
                    )));
                }
                Err(_) => return Err(LinkError::NoResponse(self.options.reply_timeout)),
            }

            let _gate = self.send_gate.read();
            match self.state() {
                StreamState::CompressNegotiating => continue,
                StreamState::Active | StreamState::AwaitingFeatures => {
                    break self.enqueue_acked(Element::Stanza(stanza))?;
                }
                StreamState::Closing | StreamState::Closed => {
                    return Err(LinkError::not_connected(format!(
                        "stream {} is closed",
                        self.id
                    )));
                }
                other => {
                    return Err(LinkError::not_connected(format!(
                        "stream {} is not open ({other:?})",
                        self.id
                    )));
                }
            }
        };

        self.await_ack(ack).await?;
        self.touch();
        Ok(())
    }

    /// Run the compression handshake as initiator.
    ///
    /// Returns `Ok(true)` once the channel is compressed. A method mismatch
    /// or refusal yields `UnsupportedFeature` and a timeout yields
    /// `NoResponse`; in both cases the stream stays usable uncompressed.
    pub async fn negotiate_compression(&self, local_methods: &[String]) -> Result<bool, LinkError> {
        if self.is_compression_active() {
            return Ok(true);
        }
        if self.role != StreamRole::Initiator {
            return Err(LinkError::protocol("only the initiator requests compression"));
        }
        if !self.is_modern_protocol() {
            return Err(LinkError::UnsupportedFeature(
                "legacy stream has no features".into(),
            ));
        }
        let remote = self.remote_features().compression_methods;
        let Some(method) = local_methods
            .iter()
            .find(|m| remote.contains(m) && ElementCodec::supports(m))
            .cloned()
        else {
            return Err(LinkError::UnsupportedFeature(format!(
                "no common compression method (local {local_methods:?}, remote {remote:?})"
            )));
        };

        let (tx, rx) = oneshot::channel();
        *self.compress_waiter.lock() = Some(tx);
        {
            let _gate = self.send_gate.write();
            if !self.advance(StreamState::CompressNegotiating) {
                self.compress_waiter.lock().take();
                return Err(LinkError::not_connected(format!(
                    "stream {} is not active",
                    self.id
                )));
            }
            if let Err(e) = self.enqueue(WriteOp::Element(Element::Compress {
                method: method.clone(),
            })) {
                self.compress_waiter.lock().take();
                return Err(e);
            }
        }

        let timeout = self.options.reply_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => {
                info!("[{}] compression enabled ({method})", self.id);
                Ok(true)
            }
            Ok(Ok(false)) => Err(LinkError::UnsupportedFeature(format!(
                "peer refused {method}"
            ))),
            Ok(Err(_)) => Err(LinkError::not_connected(format!(
                "stream {} closed during compression handshake",
                self.id
            ))),
            Err(_) => {
                self.compress_waiter.lock().take();
                self.advance(StreamState::Active);
                warn!("[{}] compression handshake timed out", self.id);
                Err(LinkError::NoResponse(timeout))
            }
        }
    }

    /// Close the stream. Safe to call any number of times from any task.
    pub fn close_channel(&self) {
        let was_opened = !matches!(self.state(), StreamState::Idle);
        if !self.advance(StreamState::Closing) {
            return;
        }
        let _ = self.enqueue(WriteOp::Close {
            send_close: was_opened,
        });
        self.cancel.cancel();
        self.compress_waiter.lock().take();
        self.advance(StreamState::Closed);
        debug!("[{}] channel closed", self.id);
    }

    // ── reader-side handling ──────────────────────────────────────────

    fn handle_element(
        self: &Arc<Self>,
        element: Element,
        source: &mut ElementSource,
        observer: &Weak<dyn StreamObserver>,
    ) -> Result<Flow, LinkError> {
        match element {
            Element::StreamOpen(header) => self.on_stream_open(header, observer),
            Element::Features(features) => self.on_features(features),
            Element::Compress { method } => self.on_compress(method, source),
            Element::Compressed => self.on_compressed(source),
            Element::Failure {
                namespace,
                condition,
            } => self.on_failure(namespace, condition),
            Element::StreamClose { namespace } => {
                if namespace != STREAM_NAMESPACE {
                    warn!(
                        "[{}] ignoring closing tag with namespace {namespace}",
                        self.id
                    );
                    return Ok(Flow::Continue);
                }
                debug!("[{}] remote closed the stream", self.id);
                self.close_received.store(true, Ordering::Release);
                self.close_channel();
                Ok(Flow::Stop)
            }
            Element::Stanza(stanza) => {
                if self.peer().is_none() || self.state() == StreamState::Idle {
                    return Err(LinkError::protocol("stanza before stream-open"));
                }
                if let Some(observer) = observer.upgrade() {
                    observer.stanza_received(self, stanza);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn on_stream_open(
        self: &Arc<Self>,
        header: StreamHeader,
        observer: &Weak<dyn StreamObserver>,
    ) -> Result<Flow, LinkError> {
        match self.role {
            StreamRole::Initiator => {
                match self.state() {
                    StreamState::Opening => {
                        let versioned = header.is_versioned();
                        self.modern.store(versioned, Ordering::Release);
                        if versioned {
                            self.advance(StreamState::AwaitingFeatures);
                        } else {
                            debug!("[{}] legacy stream, no features expected", self.id);
                            self.advance(StreamState::Active);
                        }
                    }
                    // Reply to the restart after compression.
                    StreamState::Active if self.is_compression_active() => {}
                    other => {
                        return Err(LinkError::protocol(format!(
                            "unexpected stream-open in {other:?}"
                        )));
                    }
                }
                Ok(Flow::Continue)
            }
            StreamRole::Responder => {
                let Some(remote) = header.from.clone() else {
                    return Err(LinkError::protocol("stream-open without sender"));
                };

                if let Some(known) = self.peer() {
                    // Restart, e.g. after compression was switched on.
                    if known != remote {
                        return Err(LinkError::protocol(format!(
                            "stream restart from {remote}, expected {known}"
                        )));
                    }
                    self.enqueue(WriteOp::Element(
                        self.header_for(Some(remote), header.version.clone()),
                    ))?;
                    if self.is_modern_protocol() {
                        self.enqueue(WriteOp::Element(Element::Features(
                            self.advertised_features(),
                        )))?;
                    }
                    return Ok(Flow::Continue);
                }

                let accepted = observer
                    .upgrade()
                    .is_some_and(|observer| observer.identify(self, &remote));
                if !accepted {
                    info!("[{}] rejecting stream from unknown peer {remote}", self.id);
                    self.close_channel();
                    return Ok(Flow::Stop);
                }
                *self.peer.write() = Some(remote.clone());

                let versioned = header.is_versioned();
                self.modern.store(versioned, Ordering::Release);
                if !self.advance(StreamState::Opening) {
                    return Err(LinkError::protocol("duplicate stream-open"));
                }
                let version = versioned.then(|| STREAM_VERSION.to_string());
                self.enqueue(WriteOp::Element(self.header_for(Some(remote), version)))?;

                if versioned {
                    self.advance(StreamState::AwaitingFeatures);
                    self.enqueue(WriteOp::Element(Element::Features(
                        self.advertised_features(),
                    )))?;
                }
                self.advance(StreamState::Active);

                if let Some(observer) = observer.upgrade() {
                    observer.incoming_ready(self);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn advertised_features(&self) -> StreamFeatures {
        let compression_methods = if self.is_compression_active() {
            Vec::new()
        } else {
            self.options
                .compression_methods
                .iter()
                .filter(|m| ElementCodec::supports(m))
                .cloned()
                .collect()
        };
        StreamFeatures {
            compression_methods,
            extras: Vec::new(),
        }
    }

    fn on_features(&self, features: StreamFeatures) -> Result<Flow, LinkError> {
        *self.remote_features.lock() = features;
        match (self.role, self.state()) {
            (StreamRole::Initiator, StreamState::AwaitingFeatures) => {
                self.advance(StreamState::Active);
                Ok(Flow::Continue)
            }
            (StreamRole::Initiator, StreamState::Opening | StreamState::Idle) => {
                Err(LinkError::protocol("features before stream-open"))
            }
            _ => Ok(Flow::Continue),
        }
    }

    fn on_compress(&self, method: String, source: &mut ElementSource) -> Result<Flow, LinkError> {
        if self.role != StreamRole::Responder {
            return Err(LinkError::protocol("compress request sent to initiator"));
        }
        let offered = self.advertised_features().compression_methods;
        if self.state() != StreamState::Active || !offered.contains(&method) {
            debug!("[{}] refusing compression method {method}", self.id);
            self.enqueue(WriteOp::Element(Element::Failure {
                namespace: COMPRESS_NAMESPACE.to_string(),
                condition: "unsupported-method".to_string(),
            }))?;
            return Ok(Flow::Continue);
        }

        {
            let _gate = self.send_gate.write();
            self.advance(StreamState::CompressNegotiating);
            self.enqueue(WriteOp::Element(Element::Compressed))?;
            self.enqueue(WriteOp::EnableCompression)?;
        }
        source.decoder_mut().enable_compression();
        self.compression_active.store(true, Ordering::Release);
        self.advance(StreamState::Active);
        info!("[{}] compression enabled ({method})", self.id);
        Ok(Flow::Continue)
    }

    fn on_compressed(&self, source: &mut ElementSource) -> Result<Flow, LinkError> {
        if self.role != StreamRole::Initiator || self.state() != StreamState::CompressNegotiating {
            return Err(LinkError::protocol(format!(
                "unexpected compressed in {:?}",
                self.state()
            )));
        }
        self.enqueue(WriteOp::EnableCompression)?;
        source.decoder_mut().enable_compression();
        self.compression_active.store(true, Ordering::Release);

        // The stream restarts over the compressed channel.
        let peer = self.peer();
        self.enqueue(WriteOp::Element(
            self.header_for(peer, Some(STREAM_VERSION.to_string())),
        ))?;
        self.advance(StreamState::Active);
        if let Some(waiter) = self.compress_waiter.lock().take() {
            let _ = waiter.send(true);
        }
        Ok(Flow::Continue)
    }

    fn on_failure(&self, namespace: String, condition: String) -> Result<Flow, LinkError> {
        if namespace != COMPRESS_NAMESPACE {
            return Err(LinkError::protocol(format!(
                "stream failure {condition} ({namespace})"
            )));
        }
        if self.state() == StreamState::CompressNegotiating {
            debug!("[{}] compression refused: {condition}", self.id);
            self.advance(StreamState::Active);
            if let Some(waiter) = self.compress_waiter.lock().take() {
                let _ = waiter.send(false);
            }
        } else {
            warn!("[{}] stray compression failure: {condition}", self.id);
        }
        Ok(Flow::Continue)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Reader and writer halves of a prepared stream, not yet running.
pub(crate) struct StreamTasks {
    stream: Arc<Stream>,
    source: ElementSource,
    sink: ElementSink,
    writer_rx: mpsc::UnboundedReceiver<WriteRequest>,
    observer: Weak<dyn StreamObserver>,
}

impl StreamTasks {
    pub(crate) fn start(self) {
        let StreamTasks {
            stream,
            source,
            sink,
            writer_rx,
            observer,
        } = self;
        tokio::spawn(write_loop(
            sink,
            writer_rx,
            stream.cancel.clone(),
            stream.options.reply_timeout,
        ));
        tokio::spawn(read_loop(stream, source, observer));
    }
}

async fn read_loop(
    stream: Arc<Stream>,
    mut source: ElementSource,
    observer: Weak<dyn StreamObserver>,
) {
    let fault = loop {
        let next = tokio::select! {
            _ = stream.cancel.cancelled() => {
                if stream.state().is_shutting_down() {
                    break None;
                }
                // Cancelled by a failed write rather than a close.
                break Some(LinkError::not_connected("write side of the channel failed"));
            }
            next = source.next() => next,
        };
        match next {
            Some(Ok(element)) => {
                stream.touch();
                match stream.handle_element(element, &mut source, &observer) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break None,
                    Err(e) => break Some(e),
                }
            }
            Some(Err(e)) => {
                if stream.state().is_shutting_down() {
                    break None;
                }
                break Some(e);
            }
            None => {
                if stream.close_received.load(Ordering::Acquire)
                    || stream.state().is_shutting_down()
                {
                    break None;
                }
                break Some(LinkError::protocol("end of input without closing element"));
            }
        }
    };

    if let Some(ref e) = fault {
        warn!("[{}] stream terminated: {e}", stream.id);
    }
    stream.close_channel();
    if let Some(observer) = observer.upgrade() {
        observer.stream_terminated(&stream, fault);
    }
}

async fn write_loop(
    mut sink: ElementSink,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    cancel: CancellationToken,
    close_timeout: Duration,
) {
    loop {
        let request = tokio::select! {
            biased;
            request = rx.recv() => request,
            _ = cancel.cancelled() => {
                // Drain a close queued just before cancellation.
                match rx.try_recv() {
                    Ok(request) => Some(request),
                    Err(_) => None,
                }
            }
        };
        let Some(WriteRequest { op, ack }) = request else {
            break;
        };

        let result = match op {
            WriteOp::Element(element) => sink
                .send(element)
                .await
                .map_err(|e| LinkError::not_connected(format!("write failed: {e}"))),
            WriteOp::EnableCompression => {
                sink.encoder_mut().enable_compression();
                Ok(())
            }
            WriteOp::Close { send_close } => {
                let _ = tokio::time::timeout(close_timeout, async {
                    if send_close {
                        let _ = sink.send(Element::stream_close()).await;
                    }
                    let _ = sink.close().await;
                })
                .await;
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                break;
            }
        };

        let failed = result.is_err();
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if failed {
            cancel.cancel();
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
