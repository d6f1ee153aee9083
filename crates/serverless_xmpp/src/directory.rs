//! Peer directory — the last known record for every discovered peer.
//!
//! Fed by the discovery backend through [`PeerDirectory::resolved`] and
//! [`PeerDirectory::removed`]. Consulted by the registry before dialing and
//! by the router when answering roster queries.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::event::{EventBus, LinkEvent};
use crate::identity::PeerIdentity;
use crate::presence::PeerRecord;

#[derive(Debug, Clone)]
struct DirectoryEntry {
    record: PeerRecord,
    updated_at: DateTime<Utc>,
}

/// Thread-safe store of discovered peers plus our own announced record.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerIdentity, DirectoryEntry>>,
    local: RwLock<PeerRecord>,
    events: EventBus,
}

impl PeerDirectory {
    pub fn new(local: PeerRecord, events: EventBus) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            local: RwLock::new(local),
            events,
        }
    }

    /// Record a discovery resolution.
    ///
    /// Returns `true` if subscribers were notified. A resolution whose
    /// content matches the stored record only merges its hosts in and
    /// notifies nobody. Resolutions of our own identity are ignored.
    pub fn resolved(
        &self,
        identity: PeerIdentity,
        hosts: Vec<String>,
        port: u16,
        attributes: &BTreeMap<String, String>,
    ) -> bool {
        if identity == self.local_identity() {
            return false;
        }

        let incoming = PeerRecord::from_txt(identity.clone(), hosts, port, attributes);
        {
            let mut peers = self.peers.write();
            match peers.get_mut(&identity) {
                Some(entry) if entry.record.same_content(&incoming) => {
                    if entry.record.merge_hosts(&incoming.hosts) {
                        debug!("Merged new hosts for {identity}: {:?}", entry.record.hosts);
                    }
                    entry.updated_at = Utc::now();
                    return false;
                }
                _ => {
                    peers.insert(
                        identity.clone(),
                        DirectoryEntry {
                            record: incoming,
                            updated_at: Utc::now(),
                        },
                    );
                }
            }
        }

        info!("Peer resolved: {identity}");
        self.events.publish(LinkEvent::PeerAdded(identity));
        true
    }

    /// Forget a peer. Returns the record that was removed, if any.
    pub fn removed(&self, identity: &PeerIdentity) -> Option<PeerRecord> {
        let removed = self.peers.write().remove(identity).map(|e| e.record);
        if removed.is_some() {
            info!("Peer removed: {identity}");
            self.events.publish(LinkEvent::PeerRemoved(identity.clone()));
        }
        removed
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<PeerRecord> {
        self.peers.read().get(identity).map(|e| e.record.clone())
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.peers.read().contains_key(identity)
    }

    /// When the record for `identity` was last refreshed by discovery.
    pub fn last_updated(&self, identity: &PeerIdentity) -> Option<DateTime<Utc>> {
        self.peers.read().get(identity).map(|e| e.updated_at)
    }

    /// Every known peer except ourselves, sorted by identity.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let local = self.local_identity();
        let mut records: Vec<PeerRecord> = self
            .peers
            .read()
            .values()
            .filter(|e| e.record.identity != local)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn local(&self) -> PeerRecord {
        self.local.read().clone()
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local.read().identity.clone()
    }

    /// Mutate our own record in place and return the updated copy.
    pub fn update_local<F>(&self, f: F) -> PeerRecord
    where
        F: FnOnce(&mut PeerRecord),
    {
        let mut local = self.local.write();
        f(&mut local);
        local.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
