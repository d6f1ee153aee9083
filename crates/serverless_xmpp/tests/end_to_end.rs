//! Two complete services talking over loopback TCP.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serverless_xmpp::{
    InboundStanza, IqPayload, IqType, LinkConfig, LinkError, LinkEvent, LinkService,
    MemoryDiscoveryHub, PeerIdentity, PeerRecord, Stanza, StanzaKind, StreamRole,
};
use tokio::sync::broadcast;

fn config(min: u16, compression: bool) -> LinkConfig {
    LinkConfig {
        listen_port_min: min,
        listen_port_max: min + 20,
        bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        reply_timeout: Duration::from_secs(2),
        compression_enabled: compression,
        ..LinkConfig::default()
    }
}

async fn pair(min: u16, compression: bool) -> (MemoryDiscoveryHub, LinkService, LinkService) {
    let hub = MemoryDiscoveryHub::new();
    let mut alice = LinkService::with_tcp(
        config(min, compression),
        PeerRecord::new(PeerIdentity::from("alice@laptop"), vec![], 0),
        Arc::new(hub.endpoint()),
    );
    let mut bob = LinkService::with_tcp(
        config(min, compression),
        PeerRecord::new(PeerIdentity::from("bob@desktop"), vec![], 0),
        Arc::new(hub.endpoint()),
    );
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    (hub, alice, bob)
}

/// Next stanza that arrived over a stream, skipping local echoes.
async fn next_remote(rx: &mut broadcast::Receiver<InboundStanza>) -> InboundStanza {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let inbound = rx.recv().await.expect("stanza feed closed");
            if inbound.stream.is_some() {
                return inbound;
            }
        }
    })
    .await
    .expect("no stanza from the network")
}

fn custom_query() -> Stanza {
    Stanza::iq(
        None,
        IqType::Get,
        IqPayload::Custom {
            namespace: "urn:test:echo".into(),
            body: serde_json::json!({ "n": 1 }),
        },
    )
}

#[tokio::test]
async fn test_message_delivered_between_services() {
    let (_hub, mut alice, mut bob) = pair(24100, false).await;
    assert!(alice.directory().contains(&bob.local_identity()));
    assert!(bob.directory().contains(&alice.local_identity()));

    let mut feed = bob.subscribe_stanzas();
    alice
        .send(Stanza::message(bob.local_identity(), "hello over tcp"))
        .await
        .unwrap();

    let got = next_remote(&mut feed).await;
    assert_eq!(got.peer, alice.local_identity());
    assert_eq!(
        got.stanza.kind,
        StanzaKind::Message {
            body: Some("hello over tcp".into()),
            thread: None,
        }
    );

    let stream = alice.registry().outgoing(&bob.local_identity()).unwrap();
    assert!(stream.is_modern_protocol());
    assert!(!stream.is_compression_active());

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_request_answered_on_same_stream() {
    let (_hub, mut alice, mut bob) = pair(24140, false).await;
    let mut feed = bob.subscribe_stanzas();
    let router = Arc::clone(bob.router());
    let responder = tokio::spawn(async move {
        let request = next_remote(&mut feed).await;
        router
            .route(request.stanza.result_reply(IqPayload::Empty))
            .await
            .unwrap();
    });

    let reply = alice
        .request(&bob.local_identity(), custom_query(), None, None)
        .await
        .unwrap();
    assert_eq!(reply.iq_type(), Some(IqType::Result));
    assert_eq!(reply.from, Some(bob.local_identity()));
    responder.await.unwrap();

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_reply_on_independent_stream_completes_request() {
    let (_hub, mut alice, mut bob) = pair(24180, false).await;
    let alice_id = alice.local_identity();
    let mut feed = bob.subscribe_stanzas();
    let registry = Arc::clone(bob.registry());
    let responder = tokio::spawn(async move {
        let request = next_remote(&mut feed).await;
        // Answer over bob's own outgoing stream, not the one the request
        // arrived on.
        let back = registry.get_or_create_outgoing(&alice_id).await.unwrap();
        assert_ne!(Some(back.id()), request.stream);
        back.send(request.stanza.result_reply(IqPayload::Empty))
            .await
            .unwrap();
    });

    let reply = alice
        .request(&bob.local_identity(), custom_query(), None, None)
        .await
        .unwrap();
    assert_eq!(reply.iq_type(), Some(IqType::Result));
    responder.await.unwrap();

    let bob_id = bob.local_identity();
    let counts = alice.registry().slot_counts(&bob_id);
    assert_eq!((counts.outgoing, counts.ingoing), (1, 1));
    assert_eq!(alice.replies().pending_count(), 0);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (_hub, mut alice, mut bob) = pair(24220, false).await;
    let err = alice
        .request(
            &bob.local_identity(),
            custom_query(),
            None,
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NoResponse(_)));
    assert_eq!(alice.replies().pending_count(), 0);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_compressed_streams_carry_traffic() {
    let (_hub, mut alice, mut bob) = pair(24260, true).await;
    let mut events = alice.subscribe_events();
    let mut feed = bob.subscribe_stanzas();

    let stream = alice
        .get_or_create_outgoing(&bob.local_identity())
        .await
        .unwrap();
    assert!(stream.is_compression_active());

    let ready = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(LinkEvent::StreamReady {
                role: StreamRole::Initiator,
                compressed,
                ..
            }) = events.recv().await
            {
                return compressed;
            }
        }
    })
    .await
    .unwrap();
    assert!(ready);

    for n in 0..3 {
        alice
            .send(Stanza::message(bob.local_identity(), format!("packed {n}")))
            .await
            .unwrap();
    }
    for n in 0..3 {
        let got = next_remote(&mut feed).await;
        assert_eq!(
            got.stanza.kind,
            StanzaKind::Message {
                body: Some(format!("packed {n}")),
                thread: None,
            }
        );
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_stop_is_seen_by_the_other_side() {
    let (_hub, mut alice, mut bob) = pair(24300, false).await;
    let alice_id = alice.local_identity();
    alice
        .send(Stanza::message(bob.local_identity(), "bye soon"))
        .await
        .unwrap();

    let mut events = bob.subscribe_events();
    let mut feed = bob.subscribe_stanzas();
    alice.stop().await;

    let gone = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let inbound = feed.recv().await.unwrap();
            if matches!(
                inbound.stanza.kind,
                StanzaKind::Presence {
                    available: false,
                    ..
                }
            ) {
                return inbound;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(gone.peer, alice_id);
    assert!(!bob.directory().contains(&alice_id));

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(LinkEvent::StreamClosed { peer, .. }) = events.recv().await {
                if peer.as_ref() == Some(&alice_id) {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(bob.registry().ingoing(&alice_id).is_none());

    bob.stop().await;
}

#[tokio::test]
async fn test_local_queries_and_unknown_peers() {
    let (_hub, mut alice, mut bob) = pair(24340, false).await;

    let mut feed = alice.subscribe_stanzas();
    alice
        .route(Stanza::iq(None, IqType::Get, IqPayload::Roster { items: vec![] }))
        .await
        .unwrap();
    // Skip any arrival echoes still in flight.
    let answer = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let inbound = feed.recv().await.unwrap();
            if inbound.stanza.iq_type() == Some(IqType::Result) {
                return inbound;
            }
        }
    })
    .await
    .unwrap();
    match answer.stanza.kind {
        StanzaKind::Iq {
            iq_type: IqType::Result,
            payload: IqPayload::Roster { items },
        } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].identity, bob.local_identity());
        }
        other => panic!("unexpected roster answer {other:?}"),
    }

    let carol = PeerIdentity::from("carol@nowhere");
    let err = alice.get_or_create_outgoing(&carol).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected(_)));
    assert_eq!(alice.registry().entry_count(), 0);

    let err = alice
        .route(Stanza::iq(Some(carol), IqType::Get, IqPayload::Empty))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NotConnected(_)));

    alice.stop().await;
    bob.stop().await;
}
