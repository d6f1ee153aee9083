//! Reply collector — request/response correlation across streams.
//!
//! A pending reply is keyed by the peer identity, not by a stream. Any
//! stream associated with that identity can complete it, which covers a
//! peer that answers on a freshly established connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::element::{IqType, Stanza};
use crate::error::LinkError;
use crate::identity::PeerIdentity;
use crate::registry::ConnectionRegistry;

/// What an awaited reply must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFilter {
    pub stanza_id: String,
    /// Accepted IQ types. Empty accepts any stanza with a matching id.
    pub kinds: Vec<IqType>,
}

impl ReplyFilter {
    /// Match the result or error answering `request`.
    pub fn for_request(request: &Stanza) -> Self {
        Self {
            stanza_id: request.id.clone(),
            kinds: vec![IqType::Result, IqType::Error],
        }
    }

    pub fn matches(&self, stanza: &Stanza) -> bool {
        if stanza.id != self.stanza_id {
            return false;
        }
        self.kinds.is_empty()
            || stanza
                .iq_type()
                .is_some_and(|kind| self.kinds.contains(&kind))
    }
}

struct PendingReply {
    identity: PeerIdentity,
    filter: ReplyFilter,
    tx: oneshot::Sender<Stanza>,
}

/// Outstanding requests, completed by whichever stream sees the reply first.
#[derive(Default)]
pub struct ReplyCollector {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
}

impl ReplyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a reply from `identity`. Register before sending so
    /// a fast reply cannot slip past.
    pub fn register(self: &Arc<Self>, identity: PeerIdentity, filter: ReplyFilter) -> PendingHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        trace!("Awaiting {} from {identity}", filter.stanza_id);
        self.pending.lock().insert(
            id,
            PendingReply {
                identity,
                filter,
                tx,
            },
        );
        PendingHandle {
            id,
            collector: Arc::downgrade(self),
            rx: Some(rx),
        }
    }

    /// Offer an inbound stanza. Returns it back if no pending reply took it.
    pub fn offer(&self, from: &PeerIdentity, stanza: Stanza) -> Option<Stanza> {
        let reply = {
            let mut pending = self.pending.lock();
            let key = pending
                .iter()
                .find(|(_, p)| &p.identity == from && p.filter.matches(&stanza))
                .map(|(key, _)| *key);
            match key.and_then(|key| pending.remove(&key).map(|reply| (key, reply))) {
                Some(found) => found,
                None => return Some(stanza),
            }
        };
        let (key, reply) = reply;

        match reply.tx.send(stanza) {
            Ok(()) => {
                debug!("Reply from {from} matched pending request {key}");
                None
            }
            // Waiter gave up between lookup and delivery.
            Err(stanza) => Some(stanza),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `stanza` to `identity`, dialing if needed, and wait for the
    /// reply matching `filter` (by default the IQ result/error).
    pub async fn request(
        self: &Arc<Self>,
        registry: &Arc<ConnectionRegistry>,
        identity: &PeerIdentity,
        mut stanza: Stanza,
        filter: Option<ReplyFilter>,
        timeout: Duration,
    ) -> Result<Stanza, LinkError> {
        if stanza.to.is_none() {
            stanza.to = Some(identity.clone());
        }
        let filter = filter.unwrap_or_else(|| ReplyFilter::for_request(&stanza));
        let handle = self.register(identity.clone(), filter);

        let exchange = async {
            let stream = registry.get_or_create_outgoing(identity).await?;
            stream.send(stanza).await?;
            handle.wait_unbounded().await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::NoResponse(timeout)),
        }
    }

    fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
    }
}

/// One outstanding reply. Dropping it cancels the wait.
pub struct PendingHandle {
    id: u64,
    collector: Weak<ReplyCollector>,
    rx: Option<oneshot::Receiver<Stanza>>,
}

impl PendingHandle {
    /// Wait for the reply, failing with `NoResponse` after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Stanza, LinkError> {
        match tokio::time::timeout(timeout, self.wait_unbounded()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::NoResponse(timeout)),
        }
    }

    async fn wait_unbounded(mut self) -> Result<Stanza, LinkError> {
        let Some(rx) = self.rx.take() else {
            return Err(LinkError::not_connected("reply already consumed"));
        };
        rx.await
            .map_err(|_| LinkError::not_connected("reply collector shut down"))
    }

    /// Stop waiting. Later matches go to the normal inbound feed.
    pub fn cancel(self) {}
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.upgrade() {
            collector.forget(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ErrorCondition, IqPayload};

    fn request_to(peer: &str) -> Stanza {
        Stanza::iq(Some(PeerIdentity::from(peer)), IqType::Get, IqPayload::Empty)
    }

    #[tokio::test]
    async fn test_offer_completes_matching_wait() {
        let collector = Arc::new(ReplyCollector::new());
        let bob = PeerIdentity::from("bob@h");
        let request = request_to("bob@h");
        let handle = collector.register(bob.clone(), ReplyFilter::for_request(&request));

        let reply = request.result_reply(IqPayload::Empty);
        assert!(collector.offer(&bob, reply.clone()).is_none());
        assert_eq!(handle.wait(Duration::from_secs(1)).await.unwrap(), reply);
        assert_eq!(collector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_ignores_other_identity_and_kind() {
        let collector = Arc::new(ReplyCollector::new());
        let bob = PeerIdentity::from("bob@h");
        let request = request_to("bob@h");
        let _handle = collector.register(bob.clone(), ReplyFilter::for_request(&request));

        let reply = request.result_reply(IqPayload::Empty);
        assert!(
            collector
                .offer(&PeerIdentity::from("carol@h"), reply.clone())
                .is_some()
        );

        let mut same_id_message = Stanza::message(bob.clone(), "hi");
        same_id_message.id = request.id.clone();
        assert!(collector.offer(&bob, same_id_message).is_some());
        assert_eq!(collector.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_error_reply_matches_default_filter() {
        let collector = Arc::new(ReplyCollector::new());
        let bob = PeerIdentity::from("bob@h");
        let request = request_to("bob@h");
        let handle = collector.register(bob.clone(), ReplyFilter::for_request(&request));

        let reply = request.error_reply(ErrorCondition::ServiceUnavailable);
        assert!(collector.offer(&bob, reply).is_none());
        let got = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.iq_type(), Some(IqType::Error));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_unregisters() {
        let collector = Arc::new(ReplyCollector::new());
        let request = request_to("bob@h");
        let handle = collector.register(
            PeerIdentity::from("bob@h"),
            ReplyFilter::for_request(&request),
        );
        let err = handle.wait(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, LinkError::NoResponse(_)));
        assert_eq!(collector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_consuming() {
        let collector = Arc::new(ReplyCollector::new());
        let bob = PeerIdentity::from("bob@h");
        let request = request_to("bob@h");
        let handle = collector.register(bob.clone(), ReplyFilter::for_request(&request));
        handle.cancel();

        let reply = request.result_reply(IqPayload::Empty);
        assert_eq!(collector.offer(&bob, reply.clone()), Some(reply));
    }
}
