//! LinkService — top-level context object for one link-local presence.
//!
//! [`LinkService`] owns everything a running presence needs:
//! - the inbound listener and its accept loop
//! - the peer directory, fed by a discovery backend
//! - the connection registry and idle reaper
//! - the stanza router and reply collector
//! - the event bus applications subscribe to

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::directory::PeerDirectory;
use crate::discovery::DiscoveryBackend;
use crate::element::Stanza;
use crate::error::LinkError;
use crate::event::{EventBus, InboundStanza, LinkEvent};
use crate::identity::PeerIdentity;
use crate::presence::PeerRecord;
use crate::reaper::IdleReaper;
use crate::registry::ConnectionRegistry;
use crate::reply::{ReplyCollector, ReplyFilter};
use crate::router::StanzaRouter;
use crate::stream::Stream;
use crate::transport::{Acceptor, TcpTransport, Transport};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One local presence on the link.
///
/// Create it with the local record and a discovery backend, then call
/// [`start()`](LinkService::start). Everything that touches the network
/// fails with [`LinkError::NotRunning`] until then.
pub struct LinkService {
    config: LinkConfig,
    events: EventBus,
    directory: Arc<PeerDirectory>,
    replies: Arc<ReplyCollector>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<StanzaRouter>,
    discovery: Arc<dyn DiscoveryBackend>,
    transport: Arc<dyn Transport>,
    /// Shutdown signal broadcaster.
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    port: Option<u16>,
    running: bool,
}

impl LinkService {
    pub fn new(
        config: LinkConfig,
        local: PeerRecord,
        discovery: Arc<dyn DiscoveryBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let directory = Arc::new(PeerDirectory::new(local, events.clone()));
        let replies = Arc::new(ReplyCollector::new());
        let registry = ConnectionRegistry::new(
            config.clone(),
            Arc::clone(&directory),
            Arc::clone(&transport),
            Arc::clone(&replies),
            events.clone(),
        );
        let router = Arc::new(StanzaRouter::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&discovery),
            Arc::clone(&replies),
            events.clone(),
        ));

        Self {
            config,
            events,
            directory,
            replies,
            registry,
            router,
            discovery,
            transport,
            shutdown_tx: None,
            tasks: Vec::new(),
            port: None,
            running: false,
        }
    }

    /// A service over plain TCP.
    pub fn with_tcp(config: LinkConfig, local: PeerRecord, discovery: Arc<dyn DiscoveryBackend>) -> Self {
        Self::new(config, local, discovery, Arc::new(TcpTransport))
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The bound listen port while running.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Our identity as currently registered.
    pub fn local_identity(&self) -> PeerIdentity {
        self.directory.local_identity()
    }

    pub fn local_record(&self) -> PeerRecord {
        self.directory.local()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<StanzaRouter> {
        &self.router
    }

    pub fn replies(&self) -> &Arc<ReplyCollector> {
        &self.replies
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_stanzas(&self) -> broadcast::Receiver<InboundStanza> {
        self.events.subscribe_stanzas()
    }

    /// Bind, announce and start the background tasks.
    ///
    /// Fails with [`LinkError::BindExhausted`] when no port in the configured
    /// range is free. Starting a running service is a no-op.
    pub async fn start(&mut self) -> Result<(), LinkError> {
        if self.running {
            return Ok(());
        }
        self.config.validate()?;

        let acceptor = self
            .transport
            .listen(
                self.config.bind_address,
                self.config.listen_port_min,
                self.config.listen_port_max,
            )
            .await?;
        let port = acceptor.local_port();
        let default_host = advertised_host(self.config.bind_address);
        let local = self.directory.update_local(|record| {
            record.port = port;
            if record.hosts.is_empty() {
                record.hosts.push(default_host);
            }
        });

        let (shutdown_tx, _) = broadcast::channel(8);

        // Subscribe before discovery starts feeding the directory.
        let echo = Self::spawn_presence_echo(
            Arc::clone(&self.router),
            Arc::clone(&self.directory),
            self.events.subscribe(),
            shutdown_tx.subscribe(),
        );

        let realized = match self.discovery.register(&local) {
            Ok(realized) => realized,
            Err(e) => {
                let _ = shutdown_tx.send(());
                echo.abort();
                return Err(e);
            }
        };
        if realized != local.identity {
            info!("Registered as {realized} instead of {}", local.identity);
            self.directory.update_local(|record| record.identity = realized.clone());
        }
        // After any rename: the directory drops resolutions of its own name.
        self.discovery.attach(&self.directory);

        let accept = Self::spawn_accept_loop(
            acceptor,
            Arc::clone(&self.registry),
            shutdown_tx.subscribe(),
        );
        let reaper = IdleReaper::new(Arc::clone(&self.registry), self.config.idle_timeout)
            .spawn(self.config.reap_interval, shutdown_tx.subscribe());

        self.tasks = vec![echo, accept, reaper];
        self.shutdown_tx = Some(shutdown_tx);
        self.port = Some(port);
        self.running = true;
        info!("Link service '{realized}' started on port {port}");
        Ok(())
    }

    /// Stop the service: close every stream, withdraw the announcement and
    /// wait for the background tasks to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        self.registry.close_all();
        if self.running {
            if let Err(e) = self.discovery.close() {
                warn!("Discovery close failed: {e}");
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Background task failed: {e}");
                }
            }
        }

        self.port = None;
        self.running = false;
        info!("Link service '{}' stopped", self.directory.local_identity());
    }

    fn ensure_running(&self) -> Result<(), LinkError> {
        if self.running {
            Ok(())
        } else {
            Err(LinkError::NotRunning)
        }
    }

    /// Route a stanza without dialing. See [`StanzaRouter::route`].
    pub async fn route(&self, stanza: Stanza) -> Result<(), LinkError> {
        self.ensure_running()?;
        self.router.route(stanza).await
    }

    /// Deliver `stanza` to its recipient, dialing an outgoing stream first
    /// when none exists.
    pub async fn send(&self, stanza: Stanza) -> Result<(), LinkError> {
        self.ensure_running()?;
        let to = stanza.to.clone().filter(|to| !to.is_empty());
        if let Some(to) = to.filter(|to| *to != self.directory.local_identity()) {
            self.registry.get_or_create_outgoing(&to).await?;
        }
        self.router.route(stanza).await
    }

    /// Send a request to `identity` and wait for its reply on any stream.
    /// `timeout` defaults to the configured reply timeout.
    pub async fn request(
        &self,
        identity: &PeerIdentity,
        stanza: Stanza,
        filter: Option<ReplyFilter>,
        timeout: Option<Duration>,
    ) -> Result<Stanza, LinkError> {
        self.ensure_running()?;
        let mut stanza = stanza;
        if stanza.from.is_none() {
            stanza.from = Some(self.directory.local_identity());
        }
        self.replies
            .request(
                &self.registry,
                identity,
                stanza,
                filter,
                timeout.unwrap_or(self.config.reply_timeout),
            )
            .await
    }

    pub async fn get_or_create_outgoing(&self, identity: &PeerIdentity) -> Result<Arc<Stream>, LinkError> {
        self.ensure_running()?;
        self.registry.get_or_create_outgoing(identity).await
    }

    /// Close every stream to `identity`.
    pub fn disconnect(&self, identity: &PeerIdentity) {
        self.registry.disconnect(identity);
    }

    /// Advertise an extra feature namespace in disco#info answers.
    pub fn add_feature(&self, namespace: impl Into<String>) {
        self.router.add_feature(namespace);
    }

    /// Update the entity-capabilities fields and re-announce them.
    pub fn set_capabilities(
        &self,
        node: impl Into<String>,
        ver: impl Into<String>,
        hash: impl Into<String>,
    ) -> Result<(), LinkError> {
        let (node, ver, hash) = (node.into(), ver.into(), hash.into());
        let record = self.directory.update_local(|record| {
            record.node = Some(node);
            record.ver = Some(ver);
            record.hash = Some(hash);
        });
        debug!("Capabilities now {:?}", record.node_ver());
        if self.running {
            self.discovery.update_text(&record)?;
        }
        Ok(())
    }

    /// Dump local presence, streams and known peers at info level.
    pub fn log_state(&self) {
        let local = self.directory.local();
        info!(
            "Local presence: {} [{}] {:?} on port {}",
            local.identity,
            local.status.as_txt(),
            local.msg,
            local.port
        );
        for stream in self.registry.streams() {
            info!(
                "  stream {} {} {} state={:?} compressed={} modern={} idle={:?}",
                stream.id(),
                stream.role(),
                stream
                    .peer()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| stream.remote_addr().to_string()),
                stream.state(),
                stream.is_compression_active(),
                stream.is_modern_protocol(),
                stream.idle_for()
            );
        }
        for peer in self.directory.snapshot() {
            info!(
                "  peer {} ({}) {:?}:{} [{}]",
                peer.identity,
                peer.display_name(),
                peer.hosts,
                peer.port,
                peer.status.as_txt()
            );
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    fn spawn_accept_loop(
        mut acceptor: Box<dyn Acceptor>,
        registry: Arc<ConnectionRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = acceptor.accept() => match accepted {
                        Ok(channel) => {
                            registry.register_incoming(channel);
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        }
                    },
                    _ = shutdown.recv() => {
                        debug!("Accept loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Turn directory changes into roster pushes and presences for the
    /// application.
    fn spawn_presence_echo(
        router: Arc<StanzaRouter>,
        directory: Arc<PeerDirectory>,
        mut events: broadcast::Receiver<LinkEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(LinkEvent::PeerAdded(identity)) => {
                            if let Some(record) = directory.get(&identity) {
                                router.announce_peer(&record);
                            }
                        }
                        Ok(LinkEvent::PeerRemoved(identity)) => {
                            router.announce_removal(&identity);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Presence echo lagged by {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Presence echo shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Host to advertise when the local record carries none.
fn advertised_host(bind: Option<IpAddr>) -> String {
    match bind {
        Some(ip) if !ip.is_unspecified() => ip.to_string(),
        _ => "127.0.0.1".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
