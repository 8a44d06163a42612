//! Test fixtures
//!
//! Agents wired over a shared [`LoopbackTransport`] and helpers that drive a
//! DID exchange to completion.

use super::async_helpers::wait_for_state;
use super::transports::LoopbackTransport;
use crate::agent::Agent;
use crate::config::Config;
use crate::core_protocol::{ConnectionRecord, ProtocolRecord, State};
use crate::core_wallet::Profile;
use std::sync::Arc;
use std::time::Duration;

/// In-memory configuration with short retry delays, reachable at `loop://<label>`
pub fn test_config(label: &str) -> Config {
    let mut config = Config::default();
    config.agent.label = label.to_string();
    config.agent.endpoint = format!("loop://{}", label);
    config.outbound.initial_backoff = Duration::from_millis(10);
    config.outbound.max_backoff = Duration::from_millis(50);
    config.outbound.max_attempts = 3;
    config
}

/// Start an agent and register its endpoint on `network`
pub async fn loopback_agent(network: &Arc<LoopbackTransport>, label: &str) -> Agent {
    loopback_agent_with(network, test_config(label)).await
}

pub async fn loopback_agent_with(network: &Arc<LoopbackTransport>, config: Config) -> Agent {
    let agent = Agent::start(config, network.clone()).await.expect("agent starts");
    network.register(agent.endpoint(), &agent);
    agent
}

/// Run a DID exchange between two tenants and return both completed records
///
/// The returned pair is `(inviter side, invitee side)`.
pub async fn connect(
    inviter: &Agent,
    inviter_profile: &Profile,
    invitee: &Agent,
    invitee_profile: &Profile,
) -> (ConnectionRecord, ConnectionRecord) {
    let mut inviter_events = inviter.subscribe();
    let mut invitee_events = invitee.subscribe();
    let record_type = ConnectionRecord::RECORD_TYPE;

    let invitation = inviter.connections(inviter_profile).create_invitation(false).await.expect("invitation");
    let invitee_side = invitee.connections(invitee_profile).receive_invitation(&invitation).await.expect("receive");
    invitee.connections(invitee_profile).send_request(&invitee_side.connection_id).await.expect("request");

    let inviter_id = wait_for_state(&mut inviter_events, inviter_profile.tenant_id(), record_type, State::RequestReceived)
        .await
        .expect("request arrives");
    inviter.connections(inviter_profile).send_response(&inviter_id).await.expect("response");

    wait_for_state(&mut invitee_events, invitee_profile.tenant_id(), record_type, State::ResponseReceived)
        .await
        .expect("response arrives");
    invitee.connections(invitee_profile).send_complete(&invitee_side.connection_id).await.expect("complete");

    wait_for_state(&mut inviter_events, inviter_profile.tenant_id(), record_type, State::Completed)
        .await
        .expect("complete arrives");

    let inviter_side = inviter.connections(inviter_profile).get(&inviter_id).await.expect("inviter record");
    let invitee_side =
        invitee.connections(invitee_profile).get(&invitee_side.connection_id).await.expect("invitee record");
    (inviter_side, invitee_side)
}

/// Two agents on one network, connected through their base tenants
pub struct ConnectedPair {
    pub network: Arc<LoopbackTransport>,
    pub alice: Agent,
    pub alice_profile: Profile,
    pub alice_connection: ConnectionRecord,
    pub bob: Agent,
    pub bob_profile: Profile,
    pub bob_connection: ConnectionRecord,
}

impl ConnectedPair {
    /// Alice invites, Bob accepts
    pub async fn new() -> Self {
        let network = LoopbackTransport::new();
        let alice = loopback_agent(&network, "alice").await;
        let bob = loopback_agent(&network, "bob").await;
        let alice_profile = alice.base_profile().await.expect("alice base");
        let bob_profile = bob.base_profile().await.expect("bob base");
        let (alice_connection, bob_connection) = connect(&alice, &alice_profile, &bob, &bob_profile).await;
        Self { network, alice, alice_profile, alice_connection, bob, bob_profile, bob_connection }
    }
}
