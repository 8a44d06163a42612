/*
    Credential and Presentation Exchange Integration Tests

    Runs issue-credential 2.0 and present-proof 2.0 between two connected
    agents:
    - propose -> offer -> request -> issue -> ack ends in `done`
    - a problem report from `offer` abandons both sides with the error code
    - out of order messages are rejected without touching the record
    - presentations are checked against the request
*/

use pigeon_core::core_protocol::{
    CredentialExchange, CredentialPreview, PresentationBody, PresentationExchange, PresentationRequest, ProtocolRecord,
    Role, State,
};
use pigeon_core::events::{AgentEvent, RejectionKind};
use pigeon_core::test_utils::{wait_for_event, wait_for_state, ConnectedPair};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

const CREDENTIAL: &str = CredentialExchange::RECORD_TYPE;
const PRESENTATION: &str = PresentationExchange::RECORD_TYPE;

fn preview() -> CredentialPreview {
    CredentialPreview::new([("name", "Bob"), ("degree", "Maths")])
}

#[tokio::test]
async fn test_credential_issuance_runs_to_done() {
    let pair = ConnectedPair::new().await;
    let (issuer, issuer_profile) = (&pair.alice, &pair.alice_profile);
    let (holder, holder_profile) = (&pair.bob, &pair.bob_profile);
    let mut issuer_events = issuer.subscribe();
    let mut holder_events = holder.subscribe();
    let issuer_tenant = issuer_profile.tenant_id();
    let holder_tenant = holder_profile.tenant_id();

    let proposal = holder
        .credentials(holder_profile)
        .propose(&pair.bob_connection.connection_id, &preview())
        .await
        .unwrap();
    assert_eq!(proposal.state, State::ProposalSent);
    assert_eq!(proposal.role, Role::Holder);

    let issuer_id = wait_for_state(&mut issuer_events, issuer_tenant, CREDENTIAL, State::ProposalReceived).await.unwrap();
    issuer.credentials(issuer_profile).offer_on(&issuer_id, &preview()).await.unwrap();

    wait_for_state(&mut holder_events, holder_tenant, CREDENTIAL, State::OfferReceived).await.unwrap();
    holder
        .credentials(holder_profile)
        .request(&proposal.exchange_id, json!({ "nonce": "1234" }))
        .await
        .unwrap();

    wait_for_state(&mut issuer_events, issuer_tenant, CREDENTIAL, State::RequestReceived).await.unwrap();
    issuer
        .credentials(issuer_profile)
        .issue(&issuer_id, json!({ "values": { "name": "Bob", "degree": "Maths" } }))
        .await
        .unwrap();

    wait_for_state(&mut holder_events, holder_tenant, CREDENTIAL, State::CredentialReceived).await.unwrap();
    let done = holder.credentials(holder_profile).ack(&proposal.exchange_id).await.unwrap();
    assert_eq!(done.state, State::Done);
    assert_eq!(done.payload("credential"), Some(&json!({ "values": { "name": "Bob", "degree": "Maths" } })));

    wait_for_state(&mut issuer_events, issuer_tenant, CREDENTIAL, State::Done).await.unwrap();
    let issued = issuer.credentials(issuer_profile).get(&issuer_id).await.unwrap();
    assert_eq!(issued.role, Role::Issuer);
    assert_eq!(issued.thread_id, proposal.thread_id);
    assert_eq!(issued.connection_id.as_deref(), Some(pair.alice_connection.connection_id.as_str()));
    assert!(issued.payload("proposal").is_some());
    assert!(issued.payload("request").is_some());
}

#[tokio::test]
async fn test_problem_report_from_offer_abandons_exchange() {
    let pair = ConnectedPair::new().await;
    let mut holder_events = pair.bob.subscribe();
    let mut issuer_events = pair.alice.subscribe();

    let offer = pair
        .alice
        .credentials(&pair.alice_profile)
        .offer(&pair.alice_connection.connection_id, &preview())
        .await
        .unwrap();
    let holder_id =
        wait_for_state(&mut holder_events, pair.bob_profile.tenant_id(), CREDENTIAL, State::OfferReceived).await.unwrap();

    let abandoned = pair
        .bob
        .credentials(&pair.bob_profile)
        .abandon(&holder_id, "offer-declined", "attributes are wrong")
        .await
        .unwrap();
    assert_eq!(abandoned.state, State::Abandoned);

    wait_for_state(&mut issuer_events, pair.alice_profile.tenant_id(), CREDENTIAL, State::Abandoned).await.unwrap();
    let record = pair.alice.credentials(&pair.alice_profile).get(&offer.exchange_id).await.unwrap();
    assert_eq!(record.state, State::Abandoned);
    let error = record.error.expect("error recorded");
    assert_eq!(error.code, "offer-declined");
    assert_eq!(error.description, "attributes are wrong");
}

#[tokio::test]
async fn test_out_of_order_message_is_rejected() {
    let pair = ConnectedPair::new().await;
    let mut issuer_events = pair.alice.subscribe();
    let mut holder_events = pair.bob.subscribe();

    let offer = pair
        .alice
        .credentials(&pair.alice_profile)
        .offer(&pair.alice_connection.connection_id, &preview())
        .await
        .unwrap();
    let holder_id =
        wait_for_state(&mut holder_events, pair.bob_profile.tenant_id(), CREDENTIAL, State::OfferReceived).await.unwrap();

    // The holder cannot ack a credential it never received
    let err = pair.bob.credentials(&pair.bob_profile).ack(&holder_id).await.unwrap_err();
    assert_eq!(err.problem_code(), "invalid-transition");

    // The issuer cannot issue before a request arrived
    let err = pair.alice.credentials(&pair.alice_profile).issue(&offer.exchange_id, json!({})).await.unwrap_err();
    assert_eq!(err.problem_code(), "invalid-transition");
    assert_eq!(
        pair.alice.credentials(&pair.alice_profile).get(&offer.exchange_id).await.unwrap().state,
        State::OfferSent
    );

    // Nothing reached the wire, so no inbound rejection either
    let quiet = wait_for_event(&mut issuer_events, Duration::from_millis(200), |e| {
        matches!(e, AgentEvent::InboundRejected { .. })
    })
    .await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_presentation_is_verified_against_request() {
    let pair = ConnectedPair::new().await;
    let mut verifier_events = pair.alice.subscribe();
    let mut prover_events = pair.bob.subscribe();

    let request = PresentationRequest {
        comment: Some("proof of degree".into()),
        requested_attributes: vec!["name".into(), "degree".into()],
    };
    let requested = pair
        .alice
        .presentations(&pair.alice_profile)
        .request(&pair.alice_connection.connection_id, &request)
        .await
        .unwrap();
    assert_eq!(requested.role, Role::Verifier);

    let prover_id =
        wait_for_state(&mut prover_events, pair.bob_profile.tenant_id(), PRESENTATION, State::RequestReceived)
            .await
            .unwrap();
    let mut revealed = BTreeMap::new();
    revealed.insert("name".to_string(), "Bob".to_string());
    revealed.insert("degree".to_string(), "Maths".to_string());
    pair.bob
        .presentations(&pair.bob_profile)
        .present(&prover_id, &PresentationBody { revealed_attributes: revealed })
        .await
        .unwrap();

    wait_for_state(&mut verifier_events, pair.alice_profile.tenant_id(), PRESENTATION, State::PresentationReceived)
        .await
        .unwrap();
    let received = pair.alice.presentations(&pair.alice_profile).get(&requested.exchange_id).await.unwrap();
    assert_eq!(received.verified, Some(true));

    pair.alice.presentations(&pair.alice_profile).ack(&requested.exchange_id).await.unwrap();
    wait_for_state(&mut prover_events, pair.bob_profile.tenant_id(), PRESENTATION, State::Done).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_initiating_message_is_suppressed() {
    let pair = ConnectedPair::new().await;
    let mut holder_events = pair.bob.subscribe();

    pair.alice
        .credentials(&pair.alice_profile)
        .offer(&pair.alice_connection.connection_id, &preview())
        .await
        .unwrap();
    wait_for_state(&mut holder_events, pair.bob_profile.tenant_id(), CREDENTIAL, State::OfferReceived).await.unwrap();

    // Redeliver the exact envelope the holder already processed
    let delivered = pair.network.recorder().sent_to("loop://bob");
    let last = delivered.last().expect("offer delivered").clone();
    let outcome = pair.bob.process_inbound(&last).await;
    assert_eq!(outcome.rejection_kind(), Some(RejectionKind::Duplicate));

    assert_eq!(pair.bob.credentials(&pair.bob_profile).list(None).await.unwrap().len(), 1);
}
