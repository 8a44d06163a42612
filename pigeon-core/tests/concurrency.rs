/*
    Concurrency Tests

    - two messages racing on one thread: exactly one transition wins, the
      other is re-evaluated against the new state and rejected
    - inbound work for many tenants runs side by side
    - messages for a removed tenant are no longer accepted
*/

use pigeon_core::core_protocol::{
    AgentMessage, CredentialExchange, CredentialPreview, ProtocolFamily, ProtocolRecord, State,
};
use pigeon_core::core_wallet::ProfileSettings;
use pigeon_core::events::{AgentEvent, RejectionKind};
use pigeon_core::test_utils::{connect, loopback_agent, wait_for_event, wait_for_state, ConnectedPair, LoopbackTransport};
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_messages_on_one_thread() {
    let pair = ConnectedPair::new().await;
    let mut issuer_events = pair.alice.subscribe();
    let mut holder_events = pair.bob.subscribe();

    let offer = pair
        .alice
        .credentials(&pair.alice_profile)
        .offer(&pair.alice_connection.connection_id, &CredentialPreview::new([("name", "Bob")]))
        .await
        .unwrap();
    wait_for_state(&mut holder_events, pair.bob_profile.tenant_id(), CredentialExchange::RECORD_TYPE, State::OfferReceived)
        .await
        .unwrap();

    // Two distinct requests on the same thread, bypassing the holder's own record
    let uri = pair.bob.context().types.uri(ProtocolFamily::IssueCredential, "request-credential");
    let bob_connections = pair.bob.connections(&pair.bob_profile);
    for attempt in 0..2 {
        let request = AgentMessage::new(uri.clone(), json!({ "attempt": attempt }))
            .with_thread(offer.thread_id.clone(), None);
        bob_connections.send_message(&pair.bob_connection.connection_id, &request).await.unwrap();
    }

    let mut transitions = 0;
    let mut rejections = 0;
    while transitions + rejections < 2 {
        let event = wait_for_event(&mut issuer_events, Duration::from_secs(5), |e| {
            matches!(e, AgentEvent::StateChanged { .. } | AgentEvent::InboundRejected { .. })
        })
        .await
        .unwrap();
        match event {
            AgentEvent::StateChanged { to, thread_id, .. } => {
                assert_eq!(thread_id, offer.thread_id);
                assert_eq!(to, State::RequestReceived);
                transitions += 1;
            }
            AgentEvent::InboundRejected { kind, .. } => {
                assert_eq!(kind, RejectionKind::InvalidTransition);
                rejections += 1;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!((transitions, rejections), (1, 1));

    let record = pair.alice.credentials(&pair.alice_profile).get(&offer.exchange_id).await.unwrap();
    assert_eq!(record.state, State::RequestReceived);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tenants_connect_concurrently() {
    let network = LoopbackTransport::new();
    let hub = loopback_agent(&network, "hub").await;
    let peer = loopback_agent(&network, "peer").await;

    let mut tenants = Vec::new();
    let mut peers = Vec::new();
    for i in 0..4 {
        let settings = ProfileSettings::unprotected().with_label(format!("tenant-{}", i));
        tenants.push(hub.create_tenant(&format!("tenant-{}", i), settings).await.unwrap());
        peers.push(peer.create_tenant(&format!("peer-{}", i), ProfileSettings::unprotected()).await.unwrap());
    }

    let runs = tenants.iter().zip(&peers).map(|(tenant, peer_profile)| connect(&hub, tenant, &peer, peer_profile));
    let results = futures::future::join_all(runs).await;

    for (((hub_side, peer_side), tenant), peer_profile) in results.iter().zip(&tenants).zip(&peers) {
        assert_eq!(hub_side.state, State::Completed);
        assert_eq!(peer_side.state, State::Completed);
        assert_eq!(peer_side.their_label.as_deref(), Some(tenant.tenant_id()));

        // Each tenant sees only its own connection
        let own = hub.connections(tenant).list().await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].connection_id, hub_side.connection_id);
        assert_eq!(peer.connections(peer_profile).list().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_removed_tenant_stops_receiving() {
    let network = LoopbackTransport::new();
    let hub = loopback_agent(&network, "hub").await;
    let peer = loopback_agent(&network, "peer").await;
    let peer_profile = peer.base_profile().await.unwrap();
    let tenant = hub.create_tenant("short-lived", ProfileSettings::unprotected()).await.unwrap();
    let (_, peer_side) = connect(&hub, &tenant, &peer, &peer_profile).await;

    hub.remove_tenant("short-lived").await.unwrap();
    assert!(hub.open_tenant("short-lived").await.is_err());

    let mut hub_events = hub.subscribe();
    peer.credentials(&peer_profile)
        .propose(&peer_side.connection_id, &CredentialPreview::new([("name", "Peer")]))
        .await
        .unwrap();
    let event = wait_for_event(&mut hub_events, Duration::from_secs(5), |e| {
        matches!(e, AgentEvent::InboundRejected { .. })
    })
    .await
    .unwrap();
    assert!(matches!(event, AgentEvent::InboundRejected { tenant_id: None, kind: RejectionKind::Parse, .. }));
}
