//! Discovery backends — how presence records are announced and found.
//!
//! The service talks to discovery through [`DiscoveryBackend`]. A backend
//! feeds what it finds into the attached [`PeerDirectory`] via
//! [`PeerDirectory::resolved`] and [`PeerDirectory::removed`].
//!
//! [`MemoryDiscoveryHub`] is an in-process backend: every endpoint attached
//! to the same hub sees the others' announcements, with numeric-suffix
//! renaming on name conflicts the way multicast DNS does it.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::directory::PeerDirectory;
use crate::error::LinkError;
use crate::identity::PeerIdentity;
use crate::presence::PeerRecord;

/// The capability set a discovery mechanism provides.
pub trait DiscoveryBackend: Send + Sync {
    /// Start delivering resolutions and removals into `directory`.
    fn attach(&self, directory: &Arc<PeerDirectory>);

    /// Announce `record`. Returns the identity actually registered, which
    /// differs from the requested one after a conflict rename.
    fn register(&self, record: &PeerRecord) -> Result<PeerIdentity, LinkError>;

    /// Announce `record` again, e.g. after the service restarts listening.
    fn reannounce(&self, record: &PeerRecord) -> Result<(), LinkError>;

    /// Replace the announced attributes of an already registered record.
    fn update_text(&self, record: &PeerRecord) -> Result<(), LinkError>;

    /// Withdraw everything this backend announced and stop delivering.
    fn close(&self) -> Result<(), LinkError>;
}

// ---------------------------------------------------------------------------
// In-memory hub
// ---------------------------------------------------------------------------

type EndpointId = u64;

#[derive(Default)]
struct HubState {
    next_endpoint: EndpointId,
    announced: BTreeMap<PeerIdentity, (EndpointId, PeerRecord)>,
    subscribers: Vec<(EndpointId, Weak<PeerDirectory>)>,
}

enum Notice {
    Resolved(PeerRecord),
    Removed(PeerIdentity),
}

/// Shared in-process announcement space.
#[derive(Clone, Default)]
pub struct MemoryDiscoveryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryDiscoveryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new endpoint on this hub, for one service.
    pub fn endpoint(&self) -> MemoryDiscovery {
        let mut state = self.state.lock();
        state.next_endpoint += 1;
        MemoryDiscovery {
            hub: self.clone(),
            id: state.next_endpoint,
        }
    }

    /// Identities currently announced on the hub.
    pub fn announced(&self) -> Vec<PeerIdentity> {
        self.state.lock().announced.keys().cloned().collect()
    }

    /// Deliver `notices` to every live subscriber except `skip`.
    fn broadcast(&self, skip: Option<EndpointId>, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let targets: Vec<Arc<PeerDirectory>> = {
            let mut state = self.state.lock();
            state.subscribers.retain(|(_, d)| d.strong_count() > 0);
            state
                .subscribers
                .iter()
                .filter(|(id, _)| Some(*id) != skip)
                .filter_map(|(_, d)| d.upgrade())
                .collect()
        };
        for directory in targets {
            for notice in &notices {
                deliver(&directory, notice);
            }
        }
    }
}

fn deliver(directory: &PeerDirectory, notice: &Notice) {
    match notice {
        Notice::Resolved(record) => {
            directory.resolved(
                record.identity.clone(),
                record.hosts.clone(),
                record.port,
                &record.to_txt(),
            );
        }
        Notice::Removed(identity) => {
            directory.removed(identity);
        }
    }
}

/// Pick a free name for `wanted`, adding `-2`, `-3`, ... to the local part.
fn free_name(
    announced: &BTreeMap<PeerIdentity, (EndpointId, PeerRecord)>,
    owner: EndpointId,
    wanted: &PeerIdentity,
) -> PeerIdentity {
    let taken = |id: &PeerIdentity| announced.get(id).is_some_and(|(o, _)| *o != owner);
    if !taken(wanted) {
        return wanted.clone();
    }
    let raw = wanted.as_str();
    let (local, domain) = match raw.split_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (raw, None),
    };
    (2u32..)
        .map(|n| match domain {
            Some(domain) => PeerIdentity::new(format!("{local}-{n}@{domain}")),
            None => PeerIdentity::new(format!("{local}-{n}")),
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| wanted.clone())
}

/// One service's view of a [`MemoryDiscoveryHub`].
pub struct MemoryDiscovery {
    hub: MemoryDiscoveryHub,
    id: EndpointId,
}

impl MemoryDiscovery {
    fn owns(&self, identity: &PeerIdentity) -> bool {
        self.hub
            .state
            .lock()
            .announced
            .get(identity)
            .is_some_and(|(owner, _)| *owner == self.id)
    }

    fn store(&self, record: &PeerRecord) -> Result<(), LinkError> {
        if !self.owns(&record.identity) {
            return Err(LinkError::Discovery(format!(
                "{} is not registered by this endpoint",
                record.identity
            )));
        }
        self.hub
            .state
            .lock()
            .announced
            .insert(record.identity.clone(), (self.id, record.clone()));
        self.hub
            .broadcast(Some(self.id), vec![Notice::Resolved(record.clone())]);
        Ok(())
    }
}

impl DiscoveryBackend for MemoryDiscovery {
    fn attach(&self, directory: &Arc<PeerDirectory>) {
        let existing: Vec<Notice> = {
            let mut state = self.hub.state.lock();
            state.subscribers.push((self.id, Arc::downgrade(directory)));
            state
                .announced
                .values()
                .filter(|(owner, _)| *owner != self.id)
                .map(|(_, record)| Notice::Resolved(record.clone()))
                .collect()
        };
        for notice in &existing {
            deliver(directory, notice);
        }
    }

    fn register(&self, record: &PeerRecord) -> Result<PeerIdentity, LinkError> {
        let (realized, stale) = {
            let mut state = self.hub.state.lock();
            let realized = free_name(&state.announced, self.id, &record.identity);
            // One registration per endpoint: drop any previous name.
            let stale: Vec<PeerIdentity> = state
                .announced
                .iter()
                .filter(|(id, (owner, _))| *owner == self.id && **id != realized)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                state.announced.remove(id);
            }
            let mut stored = record.clone();
            stored.identity = realized.clone();
            state.announced.insert(realized.clone(), (self.id, stored));
            (realized, stale)
        };

        if realized != record.identity {
            info!(
                "Name {} already announced, registered as {realized}",
                record.identity
            );
        } else {
            debug!("Registered {realized}");
        }

        let mut stored = record.clone();
        stored.identity = realized.clone();
        let mut notices: Vec<Notice> = stale.into_iter().map(Notice::Removed).collect();
        notices.push(Notice::Resolved(stored));
        self.hub.broadcast(Some(self.id), notices);
        Ok(realized)
    }

    fn reannounce(&self, record: &PeerRecord) -> Result<(), LinkError> {
        self.store(record)
    }

    fn update_text(&self, record: &PeerRecord) -> Result<(), LinkError> {
        self.store(record)
    }

    fn close(&self) -> Result<(), LinkError> {
        let withdrawn: Vec<PeerIdentity> = {
            let mut state = self.hub.state.lock();
            let ids: Vec<PeerIdentity> = state
                .announced
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                state.announced.remove(id);
            }
            state.subscribers.retain(|(owner, _)| *owner != self.id);
            ids
        };
        self.hub.broadcast(
            Some(self.id),
            withdrawn.into_iter().map(Notice::Removed).collect(),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
