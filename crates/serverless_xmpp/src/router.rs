//! Stanza router — outbound application traffic.
//!
//! Stanzas addressed to a peer go out over a stream the registry already
//! holds; the router never dials. Stanzas addressed to nobody (or to the
//! local identity) are infrastructure queries and are answered locally.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::directory::PeerDirectory;
use crate::discovery::DiscoveryBackend;
use crate::element::{
    CAPS_NAMESPACE, DISCO_INFO_NAMESPACE, DiscoIdentity, ErrorCondition, IqPayload, IqType,
    RosterItem, Stanza, StanzaKind,
};
use crate::error::LinkError;
use crate::event::{EventBus, InboundStanza};
use crate::identity::PeerIdentity;
use crate::presence::PeerRecord;
use crate::registry::ConnectionRegistry;
use crate::reply::ReplyCollector;
use crate::stream::StreamState;

pub const GATEWAY_CATEGORY: &str = "gateway";
pub const GATEWAY_TYPE: &str = "xmpp";
pub const GATEWAY_NAME: &str = "Serverless";

pub struct StanzaRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<PeerDirectory>,
    discovery: Arc<dyn DiscoveryBackend>,
    replies: Arc<ReplyCollector>,
    events: EventBus,
    extra_features: RwLock<Vec<String>>,
}

impl StanzaRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<PeerDirectory>,
        discovery: Arc<dyn DiscoveryBackend>,
        replies: Arc<ReplyCollector>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            directory,
            discovery,
            replies,
            events,
            extra_features: RwLock::new(Vec::new()),
        }
    }

    /// Advertise an additional feature namespace in disco#info answers.
    pub fn add_feature(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        let mut features = self.extra_features.write();
        if !features.contains(&namespace) {
            features.push(namespace);
        }
    }

    pub fn features(&self) -> Vec<String> {
        let mut features = vec![CAPS_NAMESPACE.to_string(), DISCO_INFO_NAMESPACE.to_string()];
        features.extend(self.extra_features.read().iter().cloned());
        features
    }

    /// Route one outbound stanza.
    pub async fn route(&self, mut stanza: Stanza) -> Result<(), LinkError> {
        let local = self.directory.local_identity();
        if stanza.from.is_none() {
            stanza.from = Some(local.clone());
        }
        match stanza.to.clone() {
            Some(to) if !to.is_empty() && to != local => self.route_remote(&to, stanza).await,
            _ => self.route_local(stanza),
        }
    }

    async fn route_remote(&self, to: &PeerIdentity, stanza: Stanza) -> Result<(), LinkError> {
        let stream = self
            .registry
            .routable_stream(to)
            .ok_or_else(|| LinkError::not_connected(format!("No active stream to {to}")))?;

        let limited = stream.state() == StreamState::AwaitingFeatures || !stream.is_modern_protocol();
        if limited && stanza.is_request() {
            debug!(
                "Stream {} to {to} cannot carry request {}, answering locally",
                stream.id(),
                stanza.id
            );
            self.deliver_local(to.clone(), stanza.error_reply(ErrorCondition::FeatureNotImplemented));
            return Ok(());
        }
        stream.send(stanza).await
    }

    fn route_local(&self, stanza: Stanza) -> Result<(), LinkError> {
        let local = self.directory.local_identity();
        match &stanza.kind {
            StanzaKind::Iq {
                iq_type: IqType::Get,
                payload: IqPayload::Roster { .. },
            } => {
                let peers = self.directory.snapshot();
                let items: Vec<RosterItem> = peers.iter().map(PeerRecord::roster_item).collect();
                self.deliver_local(local, stanza.result_reply(IqPayload::Roster { items }));
                for peer in &peers {
                    self.deliver_local(peer.identity.clone(), peer.presence_stanza());
                }
                Ok(())
            }
            StanzaKind::Iq {
                iq_type: IqType::Get,
                payload: IqPayload::DiscoInfo { node, .. },
            } => {
                let own = self.directory.local().node_ver();
                let reply = match node {
                    Some(asked) if Some(asked) != own.as_ref() => {
                        stanza.error_reply(ErrorCondition::FeatureNotImplemented)
                    }
                    _ => stanza.result_reply(IqPayload::DiscoInfo {
                        node: own,
                        identities: vec![DiscoIdentity {
                            category: GATEWAY_CATEGORY.to_string(),
                            kind: GATEWAY_TYPE.to_string(),
                            name: GATEWAY_NAME.to_string(),
                        }],
                        features: self.features(),
                    }),
                };
                self.deliver_local(local, reply);
                Ok(())
            }
            StanzaKind::Presence { .. } => {
                let record = self.directory.update_local(|record| {
                    record.apply_presence(&stanza);
                });
                debug!("Local presence now {}", record.status.as_txt());
                self.discovery.update_text(&record)?;
                self.discovery.reannounce(&record)
            }
            StanzaKind::Iq { .. } if stanza.is_request() => {
                self.deliver_local(
                    local,
                    stanza.error_reply(ErrorCondition::FeatureNotImplemented),
                );
                Ok(())
            }
            _ => {
                warn!("Dropping unroutable {} stanza {}", kind_name(&stanza), stanza.id);
                Ok(())
            }
        }
    }

    /// Tell the application about a new or changed peer: a roster push
    /// followed by its presence.
    pub fn announce_peer(&self, record: &PeerRecord) {
        let local = self.directory.local_identity();
        let push = Stanza::iq(
            Some(local.clone()),
            IqType::Set,
            IqPayload::Roster {
                items: vec![record.roster_item()],
            },
        );
        self.deliver_local(local, push);
        self.deliver_local(record.identity.clone(), record.presence_stanza());
    }

    /// Tell the application a peer went away.
    pub fn announce_removal(&self, identity: &PeerIdentity) {
        let mut gone = Stanza::unavailable().with_from(identity.clone());
        gone.to = Some(self.directory.local_identity());
        self.deliver_local(identity.clone(), gone);
    }

    /// Hand a locally synthesized stanza to a pending request, or to the
    /// inbound feed if nobody is waiting for it.
    fn deliver_local(&self, peer: PeerIdentity, stanza: Stanza) {
        if let Some(stanza) = self.replies.offer(&peer, stanza) {
            self.events.deliver(InboundStanza {
                peer,
                stream: None,
                stanza,
            });
        }
    }
}

fn kind_name(stanza: &Stanza) -> &'static str {
    match stanza.kind {
        StanzaKind::Message { .. } => "message",
        StanzaKind::Presence { .. } => "presence",
        StanzaKind::Iq { .. } => "iq",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
