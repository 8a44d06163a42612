/*
    DID Exchange Integration Tests

    Two agents on a loopback network run the connection protocol through
    their dispatchers:
    - request / response / complete end in `completed` on both sides
    - keys and endpoints are exchanged and the response signature checked
    - a later message on the finished thread is rejected as stale
    - single-use invitations cannot be reused
*/

use pigeon_core::core_protocol::{AgentMessage, ConnectionRecord, ProtocolFamily, ProtocolRecord, Role, State};
use pigeon_core::events::{AgentEvent, RejectionKind};
use pigeon_core::test_utils::{loopback_agent, wait_for_event, wait_for_state, ConnectedPair, LoopbackTransport};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_connection_reaches_completed_on_both_sides() {
    let pair = ConnectedPair::new().await;

    let alice = &pair.alice_connection;
    let bob = &pair.bob_connection;
    assert_eq!(alice.state, State::Completed);
    assert_eq!(bob.state, State::Completed);
    assert_eq!(alice.role, Role::Inviter);
    assert_eq!(bob.role, Role::Invitee);

    // Same thread on both sides, keyed by the request id
    assert_eq!(alice.request_id, bob.request_id);
    assert_eq!(alice.their_verkey, bob.my_verkey);
    assert_eq!(bob.their_verkey, alice.my_verkey);
    assert_eq!(alice.their_did, bob.my_did);
    assert_eq!(alice.their_endpoint.as_deref(), Some("loop://bob"));
    assert_eq!(bob.their_endpoint.as_deref(), Some("loop://alice"));
    assert_eq!(alice.their_label.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_message_on_completed_thread_is_stale() {
    let pair = ConnectedPair::new().await;
    let mut alice_events = pair.alice.subscribe();

    let thread_id = pair.bob_connection.request_id.clone();
    let uri = pair.bob.context().types.uri(ProtocolFamily::DidExchange, "complete");
    let late = AgentMessage::new(uri, json!({})).with_thread(thread_id.clone(), None);
    pair.bob
        .connections(&pair.bob_profile)
        .send_message(&pair.bob_connection.connection_id, &late)
        .await
        .unwrap();

    let event = wait_for_event(&mut alice_events, Duration::from_secs(5), |e| {
        matches!(e, AgentEvent::InboundRejected { .. })
    })
    .await
    .unwrap();
    match event {
        AgentEvent::InboundRejected { tenant_id, thread_id: thid, kind, .. } => {
            assert_eq!(kind, RejectionKind::Stale);
            assert_eq!(tenant_id.as_deref(), Some(pair.alice_profile.tenant_id()));
            assert_eq!(thid.as_deref(), Some(thread_id.as_str()));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let record = pair.alice.connections(&pair.alice_profile).get(&pair.alice_connection.connection_id).await.unwrap();
    assert_eq!(record.state, State::Completed);
}

#[tokio::test]
async fn test_single_use_invitation_accepts_one_request() {
    let network = LoopbackTransport::new();
    let alice = loopback_agent(&network, "alice").await;
    let bob = loopback_agent(&network, "bob").await;
    let carol = loopback_agent(&network, "carol").await;
    let alice_profile = alice.base_profile().await.unwrap();
    let bob_profile = bob.base_profile().await.unwrap();
    let carol_profile = carol.base_profile().await.unwrap();
    let mut alice_events = alice.subscribe();

    let invitation = alice.connections(&alice_profile).create_invitation(false).await.unwrap();

    let bob_side = bob.connections(&bob_profile).receive_invitation(&invitation).await.unwrap();
    bob.connections(&bob_profile).send_request(&bob_side.connection_id).await.unwrap();
    wait_for_state(&mut alice_events, alice_profile.tenant_id(), ConnectionRecord::RECORD_TYPE, State::RequestReceived)
        .await
        .unwrap();

    let carol_side = carol.connections(&carol_profile).receive_invitation(&invitation).await.unwrap();
    carol.connections(&carol_profile).send_request(&carol_side.connection_id).await.unwrap();
    let event = wait_for_event(&mut alice_events, Duration::from_secs(5), |e| {
        matches!(e, AgentEvent::InboundRejected { .. })
    })
    .await
    .unwrap();
    assert!(matches!(event, AgentEvent::InboundRejected { kind: RejectionKind::NotFound, .. }));

    assert_eq!(alice.connections(&alice_profile).list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_use_invitation_accepts_many_requests() {
    let network = LoopbackTransport::new();
    let alice = loopback_agent(&network, "alice").await;
    let alice_profile = alice.base_profile().await.unwrap();
    let mut alice_events = alice.subscribe();
    let invitation = alice.connections(&alice_profile).create_invitation(true).await.unwrap();

    for label in ["bob", "carol"] {
        let peer = loopback_agent(&network, label).await;
        let profile = peer.base_profile().await.unwrap();
        let record = peer.connections(&profile).receive_invitation(&invitation).await.unwrap();
        peer.connections(&profile).send_request(&record.connection_id).await.unwrap();
        wait_for_state(&mut alice_events, alice_profile.tenant_id(), ConnectionRecord::RECORD_TYPE, State::RequestReceived)
            .await
            .unwrap();
    }

    assert_eq!(alice.connections(&alice_profile).list().await.unwrap().len(), 2);
}
