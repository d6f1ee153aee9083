//! Peer records — reachability and capability info learned from discovery.
//!
//! A [`PeerRecord`] is rebuilt wholesale from the discovery TXT attributes on
//! every update. Two records are considered the same content when their TXT
//! rendering matches; the address list is deliberately not part of that
//! comparison.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::{RosterItem, Stanza, StanzaKind, Subscription};
use crate::identity::PeerIdentity;

/// Presence status as announced in the `status` TXT key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    #[default]
    #[serde(rename = "avail")]
    Available,
    #[serde(rename = "away")]
    Away,
    #[serde(rename = "dnd")]
    DoNotDisturb,
}

impl PresenceStatus {
    pub fn as_txt(&self) -> &'static str {
        match self {
            Self::Available => "avail",
            Self::Away => "away",
            Self::DoNotDisturb => "dnd",
        }
    }

    /// Parse a TXT value. Unknown values map to `Available`.
    pub fn from_txt(value: &str) -> Self {
        match value {
            "away" => Self::Away,
            "dnd" => Self::DoNotDisturb,
            _ => Self::Available,
        }
    }
}

/// Discovered reachability and capability info for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    /// Addresses the peer is reachable at, in dial order.
    pub hosts: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub jid: Option<String>,
    #[serde(default)]
    pub nick: Option<String>,
    /// Entity capabilities hash algorithm, node and version.
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default)]
    pub msg: Option<String>,
    /// TXT keys we don't interpret.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

const TXT_VERSION: &str = "1";

impl PeerRecord {
    /// A record with no optional fields set.
    pub fn new(identity: PeerIdentity, hosts: Vec<String>, port: u16) -> Self {
        Self {
            identity,
            hosts,
            port,
            first: None,
            last: None,
            email: None,
            jid: None,
            nick: None,
            hash: None,
            node: None,
            ver: None,
            status: PresenceStatus::Available,
            msg: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Build a record from a discovery resolution.
    pub fn from_txt(
        identity: PeerIdentity,
        hosts: Vec<String>,
        port: u16,
        attributes: &BTreeMap<String, String>,
    ) -> Self {
        let mut record = Self::new(identity, hosts, port);
        for (key, value) in attributes {
            let value = value.clone();
            match key.as_str() {
                "1st" => record.first = Some(value),
                "last" => record.last = Some(value),
                "email" => record.email = Some(value),
                "jid" => record.jid = Some(value),
                "nick" => record.nick = Some(value),
                "hash" => record.hash = Some(value),
                "node" => record.node = Some(value),
                "ver" => record.ver = Some(value),
                "status" => record.status = PresenceStatus::from_txt(&value),
                "msg" => record.msg = Some(value),
                // Regenerated by to_txt.
                "txtvers" | "port.p2pj" => {}
                _ => {
                    record.attributes.insert(key.clone(), value);
                }
            }
        }
        record
    }

    /// Render the record as discovery TXT attributes.
    pub fn to_txt(&self) -> BTreeMap<String, String> {
        let mut txt = self.attributes.clone();
        txt.insert("txtvers".into(), TXT_VERSION.into());
        txt.insert("port.p2pj".into(), self.port.to_string());
        txt.insert("status".into(), self.status.as_txt().into());

        let optional = [
            ("1st", &self.first),
            ("last", &self.last),
            ("email", &self.email),
            ("jid", &self.jid),
            ("nick", &self.nick),
            ("hash", &self.hash),
            ("node", &self.node),
            ("ver", &self.ver),
            ("msg", &self.msg),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                txt.insert(key.into(), value.clone());
            }
        }
        txt
    }

    /// Whether `other` carries the same announced content, ignoring hosts.
    pub fn same_content(&self, other: &PeerRecord) -> bool {
        self.identity == other.identity && self.to_txt() == other.to_txt()
    }

    /// Union `other`'s hosts into ours, keeping order and dropping duplicates.
    /// Returns true if anything was added.
    pub fn merge_hosts(&mut self, other: &[String]) -> bool {
        let mut added = false;
        for host in other {
            if !self.hosts.contains(host) {
                self.hosts.push(host.clone());
                added = true;
            }
        }
        added
    }

    pub fn display_name(&self) -> String {
        match (&self.first, &self.last) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => self
                .jid
                .clone()
                .unwrap_or_else(|| self.identity.to_string()),
        }
    }

    /// `node#ver`, or `None` if either half is missing.
    pub fn node_ver(&self) -> Option<String> {
        match (&self.node, &self.ver) {
            (Some(node), Some(ver)) => Some(format!("{node}#{ver}")),
            _ => None,
        }
    }

    pub fn roster_item(&self) -> RosterItem {
        RosterItem {
            identity: self.identity.clone(),
            name: Some(self.display_name()),
            subscription: Subscription::Both,
        }
    }

    /// The available presence this peer is announcing.
    pub fn presence_stanza(&self) -> Stanza {
        let show = match self.status {
            PresenceStatus::Available => None,
            other => Some(other),
        };
        Stanza::presence(show, self.msg.clone()).with_from(self.identity.clone())
    }

    /// Apply the show/status of a presence stanza. Returns false if the
    /// stanza isn't a presence.
    pub fn apply_presence(&mut self, stanza: &Stanza) -> bool {
        match &stanza.kind {
            StanzaKind::Presence {
                available,
                show,
                status,
            } => {
                self.status = if *available {
                    show.unwrap_or_default()
                } else {
                    PresenceStatus::Away
                };
                self.msg = status.clone();
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
