/*
    Mediation Integration Tests

    A mediator agent serves Bob; Alice reaches Bob only through the
    mediator:
    - mediation is negotiated and a default is kept per profile
    - keys Bob creates are registered with the mediator's keylist
    - `forward` payloads are relayed byte for byte without being opened
    - envelopes addressed straight to a routed key are relayed too
*/

use pigeon_core::core_envelope::pack;
use pigeon_core::core_mediation::forward::wrap;
use pigeon_core::core_mediation::{MediationRecord, MEDIATION_RECORD};
use pigeon_core::core_protocol::{ConnectionRecord, ProtocolError, ProtocolRecord, Role, State};
use pigeon_core::core_wallet::Profile;
use pigeon_core::core_dispatch::DispatchOutcome;
use pigeon_core::events::{AgentEvent, RejectionKind, RelayTarget};
use pigeon_core::test_utils::{connect, loopback_agent, wait_for_event, wait_for_state, LoopbackTransport};
use pigeon_core::Agent;
use std::sync::Arc;
use std::time::Duration;

struct MediatedBob {
    network: Arc<LoopbackTransport>,
    mediator: Agent,
    mediator_profile: Profile,
    /// Mediator side of the mediator <-> Bob connection
    mediator_connection: ConnectionRecord,
    bob: Agent,
    bob_profile: Profile,
    bob_connection: ConnectionRecord,
}

impl MediatedBob {
    async fn new() -> Self {
        let network = LoopbackTransport::new();
        let mediator = loopback_agent(&network, "mediator").await;
        let bob = loopback_agent(&network, "bob").await;
        let mediator_profile = mediator.base_profile().await.unwrap();
        let bob_profile = bob.base_profile().await.unwrap();
        let (mediator_connection, bob_connection) = connect(&mediator, &mediator_profile, &bob, &bob_profile).await;
        Self { network, mediator, mediator_profile, mediator_connection, bob, bob_profile, bob_connection }
    }

    /// Request and grant one mediation; returns Bob's record
    async fn granted_mediation(&self) -> MediationRecord {
        let mut mediator_events = self.mediator.subscribe();
        let mut bob_events = self.bob.subscribe();

        let requested =
            self.bob.mediation(&self.bob_profile).request_mediation(&self.bob_connection.connection_id).await.unwrap();
        assert_eq!(requested.state, State::RequestSent);

        let mediator_id =
            wait_for_state(&mut mediator_events, self.mediator_profile.tenant_id(), MEDIATION_RECORD, State::RequestReceived)
                .await
                .unwrap();
        self.mediator.mediation(&self.mediator_profile).grant(&mediator_id).await.unwrap();

        wait_for_state(&mut bob_events, self.bob_profile.tenant_id(), MEDIATION_RECORD, State::Granted).await.unwrap();
        self.bob.mediation(&self.bob_profile).get(&requested.mediation_id).await.unwrap()
    }

    /// Poll the mediator's keylist until `key` is routed
    async fn wait_for_route(&self, key: &str) -> String {
        let routes = self.mediator.mediation(&self.mediator_profile).routes();
        for _ in 0..100 {
            if let Ok(connection_id) = routes.get_recipient(key).await {
                return connection_id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("key {} never reached the mediator", key);
    }

    /// Poll the transport until Bob has been sent exactly `payload`
    async fn wait_for_delivery_to_bob(&self, payload: &[u8]) {
        for _ in 0..100 {
            if self.network.recorder().sent_to("loop://bob").iter().any(|p| p.as_slice() == payload) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("payload never reached bob");
    }
}

#[tokio::test]
async fn test_grant_carries_mediator_routing() {
    let setup = MediatedBob::new().await;
    let mediation = setup.granted_mediation().await;

    assert_eq!(mediation.role, Role::Requester);
    assert_eq!(mediation.endpoint.as_deref(), Some("loop://mediator"));
    assert_eq!(mediation.routing_keys.len(), 1);

    // The routing key belongs to the mediator's base tenant
    let owner = setup.mediator.context().tenants.tenant_for_key(&mediation.routing_keys[0]).await.unwrap();
    assert_eq!(owner.as_deref(), Some(setup.mediator_profile.tenant_id()));
}

#[tokio::test]
async fn test_forward_is_relayed_unmodified() {
    let setup = MediatedBob::new().await;
    let mediation = setup.granted_mediation().await;
    setup.bob.mediation(&setup.bob_profile).set_default(&mediation.mediation_id).await.unwrap();

    let invitation = setup.bob.connections(&setup.bob_profile).create_invitation(true).await.unwrap();
    assert_eq!(invitation.service_endpoint, "loop://mediator");
    assert_eq!(invitation.routing_keys, mediation.routing_keys);
    let bob_key = invitation.recipient_keys[0].clone();
    assert_eq!(setup.wait_for_route(&bob_key).await, setup.mediator_connection.connection_id);

    let inner = pack(br#"{"id":"m-1","type":"https://didcomm.org/basicmessage/1.0/message"}"#, &[bob_key.clone()], None)
        .unwrap()
        .to_bytes()
        .unwrap();
    let wrapped = wrap(inner.clone(), &bob_key, &mediation.routing_keys, &setup.mediator.context().types).unwrap();

    let outcome = setup.mediator.process_inbound(&wrapped).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Relayed {
            tenant_id: setup.mediator_profile.tenant_id().to_string(),
            target: RelayTarget::Connection(setup.mediator_connection.connection_id.clone()),
        }
    );

    setup.wait_for_delivery_to_bob(&inner).await;

    // The mediator never held the key the payload was sealed to
    assert_eq!(setup.mediator.context().tenants.tenant_for_key(&bob_key).await.unwrap(), None);
}

#[tokio::test]
async fn test_envelope_for_routed_key_is_relayed() {
    let setup = MediatedBob::new().await;
    let mediation = setup.granted_mediation().await;
    setup.bob.mediation(&setup.bob_profile).set_default(&mediation.mediation_id).await.unwrap();
    let invitation = setup.bob.connections(&setup.bob_profile).create_invitation(true).await.unwrap();
    let bob_key = invitation.recipient_keys[0].clone();
    setup.wait_for_route(&bob_key).await;

    let envelope = pack(b"{}", &[bob_key], None).unwrap().to_bytes().unwrap();
    let outcome = setup.mediator.process_inbound(&envelope).await;
    assert!(matches!(outcome, DispatchOutcome::Relayed { .. }));
    setup.wait_for_delivery_to_bob(&envelope).await;
}

#[tokio::test]
async fn test_forward_to_unknown_key_is_rejected() {
    let setup = MediatedBob::new().await;
    let mediation = setup.granted_mediation().await;

    let stranger = pigeon_core::core_envelope::KeyPair::generate().verkey();
    let inner = pack(b"{}", &[stranger.clone()], None).unwrap().to_bytes().unwrap();
    let wrapped = wrap(inner, &stranger, &mediation.routing_keys, &setup.mediator.context().types).unwrap();

    let outcome = setup.mediator.process_inbound(&wrapped).await;
    assert_eq!(outcome.rejection_kind(), Some(RejectionKind::Routing));
}

#[tokio::test]
async fn test_connection_through_mediator() {
    let setup = MediatedBob::new().await;
    let mediation = setup.granted_mediation().await;
    setup.bob.mediation(&setup.bob_profile).set_default(&mediation.mediation_id).await.unwrap();

    let alice = loopback_agent(&setup.network, "alice").await;
    let alice_profile = alice.base_profile().await.unwrap();
    let mut alice_events = alice.subscribe();
    let mut bob_events = setup.bob.subscribe();
    let mut mediator_events = setup.mediator.subscribe();
    let record_type = ConnectionRecord::RECORD_TYPE;

    let invitation = setup.bob.connections(&setup.bob_profile).create_invitation(false).await.unwrap();
    setup.wait_for_route(&invitation.recipient_keys[0]).await;

    let alice_side = alice.connections(&alice_profile).receive_invitation(&invitation).await.unwrap();
    alice.connections(&alice_profile).send_request(&alice_side.connection_id).await.unwrap();

    let bob_id = wait_for_state(&mut bob_events, setup.bob_profile.tenant_id(), record_type, State::RequestReceived)
        .await
        .unwrap();
    let forwarded = wait_for_event(&mut mediator_events, Duration::from_secs(5), |e| {
        matches!(e, AgentEvent::Forwarded { .. })
    })
    .await
    .unwrap();
    assert!(matches!(forwarded, AgentEvent::Forwarded { target: RelayTarget::Connection(_), .. }));

    let bob_side = setup.bob.connections(&setup.bob_profile).send_response(&bob_id).await.unwrap();
    let bob_key = bob_side.my_verkey.clone().expect("bob key assigned");
    setup.wait_for_route(&bob_key).await;

    wait_for_state(&mut alice_events, alice_profile.tenant_id(), record_type, State::ResponseReceived).await.unwrap();
    let alice_side = alice.connections(&alice_profile).get(&alice_side.connection_id).await.unwrap();
    assert_eq!(alice_side.their_endpoint.as_deref(), Some("loop://mediator"));
    assert_eq!(alice_side.their_routing_keys, mediation.routing_keys);

    alice.connections(&alice_profile).send_complete(&alice_side.connection_id).await.unwrap();
    wait_for_state(&mut bob_events, setup.bob_profile.tenant_id(), record_type, State::Completed).await.unwrap();
}

#[tokio::test]
async fn test_default_mediation_is_unique() {
    let setup = MediatedBob::new().await;
    let first = setup.granted_mediation().await;
    let second = setup.granted_mediation().await;
    let manager = setup.bob.mediation(&setup.bob_profile);

    manager.set_default(&first.mediation_id).await.unwrap();
    manager.set_default(&first.mediation_id).await.unwrap();
    let defaults: Vec<_> = manager.list().await.unwrap().into_iter().filter(|m| m.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].mediation_id, first.mediation_id);

    manager.set_default(&second.mediation_id).await.unwrap();
    let defaults: Vec<_> = manager.list().await.unwrap().into_iter().filter(|m| m.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].mediation_id, second.mediation_id);

    manager.clear_default().await.unwrap();
    assert!(manager.get_default().await.unwrap().is_none());
}

#[tokio::test]
async fn test_only_granted_mediation_can_be_default() {
    let setup = MediatedBob::new().await;
    let mut mediator_events = setup.mediator.subscribe();
    let mut bob_events = setup.bob.subscribe();

    let requested =
        setup.bob.mediation(&setup.bob_profile).request_mediation(&setup.bob_connection.connection_id).await.unwrap();
    let mediator_id =
        wait_for_state(&mut mediator_events, setup.mediator_profile.tenant_id(), MEDIATION_RECORD, State::RequestReceived)
            .await
            .unwrap();
    setup.mediator.mediation(&setup.mediator_profile).deny(&mediator_id).await.unwrap();
    wait_for_state(&mut bob_events, setup.bob_profile.tenant_id(), MEDIATION_RECORD, State::Denied).await.unwrap();

    let err = setup.bob.mediation(&setup.bob_profile).set_default(&requested.mediation_id).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotReady(_)));
}
