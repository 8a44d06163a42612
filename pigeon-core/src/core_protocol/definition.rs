//! Static transition tables
//!
//! Each protocol is a table of `(state, message, role, direction)` entries.
//! Anything not listed is an invalid transition; problem reports are handled
//! by the engine and never appear in the tables.

use super::message_type::ProtocolFamily;
use super::state::{Direction, Role, State};

/// Work done alongside a transition, before the record is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Keep the message body in the record payload under this key
    Store(&'static str),
    /// Record the requester's DID document
    AcceptRequest,
    /// Check the inviter's signature and record its DID document
    AcceptResponse,
    /// Keep the presentation and check it against the request
    VerifyPresentation,
    /// Keep the routing keys and endpoint of a grant
    RecordGrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub message: &'static str,
    pub role: Role,
    pub direction: Direction,
    pub to: State,
    pub effect: Effect,
}

impl Transition {
    const fn new(
        from: State,
        message: &'static str,
        role: Role,
        direction: Direction,
        to: State,
        effect: Effect,
    ) -> Self {
        Self { from, message, role, direction, to, effect }
    }
}

#[derive(Debug)]
pub struct ProtocolDefinition {
    pub family: ProtocolFamily,
    pub terminal: &'static [State],
    pub transitions: &'static [Transition],
}

impl ProtocolDefinition {
    pub fn lookup(&self, from: State, message: &str, role: Role, direction: Direction) -> Option<&Transition> {
        self.transitions.iter().find(|t| {
            t.from == from && t.message == message && t.role == role && t.direction == direction
        })
    }

    pub fn is_terminal(&self, state: State) -> bool {
        self.terminal.contains(&state)
    }

    /// Role that starts a thread by sending or receiving `message`
    pub fn initiating_role(&self, message: &str, direction: Direction) -> Option<Role> {
        self.transitions
            .iter()
            .find(|t| t.from == State::Start && t.message == message && t.direction == direction)
            .map(|t| t.role)
    }
}

use Direction::{Received as R, Sent as S};
use Effect::Store;

pub static DID_EXCHANGE: ProtocolDefinition = ProtocolDefinition {
    family: ProtocolFamily::DidExchange,
    terminal: &[State::Completed, State::Abandoned],
    transitions: &[
        Transition::new(State::Start, "request", Role::Inviter, R, State::RequestReceived, Effect::AcceptRequest),
        Transition::new(State::RequestReceived, "response", Role::Inviter, S, State::ResponseSent, Effect::None),
        Transition::new(State::ResponseSent, "complete", Role::Inviter, R, State::Completed, Effect::None),
        Transition::new(State::Start, "request", Role::Invitee, S, State::RequestSent, Effect::None),
        Transition::new(State::RequestSent, "response", Role::Invitee, R, State::ResponseReceived, Effect::AcceptResponse),
        Transition::new(State::ResponseReceived, "complete", Role::Invitee, S, State::Completed, Effect::None),
    ],
};

pub static ISSUE_CREDENTIAL: ProtocolDefinition = ProtocolDefinition {
    family: ProtocolFamily::IssueCredential,
    terminal: &[State::Done, State::Abandoned],
    transitions: &[
        // issuer
        Transition::new(State::Start, "propose-credential", Role::Issuer, R, State::ProposalReceived, Store("proposal")),
        Transition::new(State::Start, "offer-credential", Role::Issuer, S, State::OfferSent, Store("offer")),
        Transition::new(State::ProposalReceived, "offer-credential", Role::Issuer, S, State::OfferSent, Store("offer")),
        Transition::new(State::OfferSent, "propose-credential", Role::Issuer, R, State::ProposalReceived, Store("proposal")),
        Transition::new(State::OfferSent, "request-credential", Role::Issuer, R, State::RequestReceived, Store("request")),
        Transition::new(State::RequestReceived, "issue-credential", Role::Issuer, S, State::CredentialIssued, Store("credential")),
        Transition::new(State::CredentialIssued, "ack", Role::Issuer, R, State::Done, Effect::None),
        // holder
        Transition::new(State::Start, "propose-credential", Role::Holder, S, State::ProposalSent, Store("proposal")),
        Transition::new(State::Start, "offer-credential", Role::Holder, R, State::OfferReceived, Store("offer")),
        Transition::new(State::ProposalSent, "offer-credential", Role::Holder, R, State::OfferReceived, Store("offer")),
        Transition::new(State::OfferReceived, "propose-credential", Role::Holder, S, State::ProposalSent, Store("proposal")),
        Transition::new(State::OfferReceived, "request-credential", Role::Holder, S, State::RequestSent, Store("request")),
        Transition::new(State::RequestSent, "issue-credential", Role::Holder, R, State::CredentialReceived, Store("credential")),
        Transition::new(State::CredentialReceived, "ack", Role::Holder, S, State::Done, Effect::None),
    ],
};

pub static PRESENT_PROOF: ProtocolDefinition = ProtocolDefinition {
    family: ProtocolFamily::PresentProof,
    terminal: &[State::Done, State::Abandoned],
    transitions: &[
        // verifier
        Transition::new(State::Start, "propose-presentation", Role::Verifier, R, State::ProposalReceived, Store("proposal")),
        Transition::new(State::Start, "request-presentation", Role::Verifier, S, State::RequestSent, Store("request")),
        Transition::new(State::ProposalReceived, "request-presentation", Role::Verifier, S, State::RequestSent, Store("request")),
        Transition::new(State::RequestSent, "presentation", Role::Verifier, R, State::PresentationReceived, Effect::VerifyPresentation),
        Transition::new(State::PresentationReceived, "ack", Role::Verifier, S, State::Done, Effect::None),
        // prover
        Transition::new(State::Start, "propose-presentation", Role::Prover, S, State::ProposalSent, Store("proposal")),
        Transition::new(State::Start, "request-presentation", Role::Prover, R, State::RequestReceived, Store("request")),
        Transition::new(State::ProposalSent, "request-presentation", Role::Prover, R, State::RequestReceived, Store("request")),
        Transition::new(State::RequestReceived, "presentation", Role::Prover, S, State::PresentationSent, Store("presentation")),
        Transition::new(State::PresentationSent, "ack", Role::Prover, R, State::Done, Effect::None),
    ],
};

pub static COORDINATE_MEDIATION: ProtocolDefinition = ProtocolDefinition {
    family: ProtocolFamily::CoordinateMediation,
    terminal: &[State::Granted, State::Denied, State::Abandoned],
    transitions: &[
        Transition::new(State::Start, "mediate-request", Role::Requester, S, State::RequestSent, Effect::None),
        Transition::new(State::RequestSent, "mediate-grant", Role::Requester, R, State::Granted, Effect::RecordGrant),
        Transition::new(State::RequestSent, "mediate-deny", Role::Requester, R, State::Denied, Effect::None),
        Transition::new(State::Start, "mediate-request", Role::Mediator, R, State::RequestReceived, Effect::None),
        Transition::new(State::RequestReceived, "mediate-grant", Role::Mediator, S, State::Granted, Effect::RecordGrant),
        Transition::new(State::RequestReceived, "mediate-deny", Role::Mediator, S, State::Denied, Effect::None),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [&ProtocolDefinition; 4] = [&DID_EXCHANGE, &ISSUE_CREDENTIAL, &PRESENT_PROOF, &COORDINATE_MEDIATION];

    #[test]
    fn test_tables_are_deterministic() {
        for def in ALL {
            let mut keys = HashSet::new();
            for t in def.transitions {
                assert!(keys.insert((t.from, t.message, t.role, t.direction)), "{:?} listed twice", t);
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for def in ALL {
            assert!(def.is_terminal(State::Abandoned));
            for t in def.transitions {
                assert!(!def.is_terminal(t.from), "{:?} leaves a terminal state", t);
                assert_ne!(t.to, State::Start);
            }
        }
    }

    #[test]
    fn test_messages_belong_to_family() {
        for def in ALL {
            for t in def.transitions {
                assert!(def.family.message_names().contains(&t.message), "{} not in {}", t.message, def.family);
            }
        }
    }

    #[test]
    fn test_initiating_roles_are_unique() {
        assert_eq!(DID_EXCHANGE.initiating_role("request", Direction::Received), Some(Role::Inviter));
        assert_eq!(DID_EXCHANGE.initiating_role("request", Direction::Sent), Some(Role::Invitee));
        assert_eq!(DID_EXCHANGE.initiating_role("complete", Direction::Received), None);
        assert_eq!(ISSUE_CREDENTIAL.initiating_role("offer-credential", Direction::Received), Some(Role::Holder));
        assert_eq!(PRESENT_PROOF.initiating_role("request-presentation", Direction::Sent), Some(Role::Verifier));
        assert_eq!(COORDINATE_MEDIATION.initiating_role("mediate-grant", Direction::Received), None);
    }

    #[test]
    fn test_full_credential_walk() {
        let steps = [
            ("propose-credential", Direction::Received, State::ProposalReceived),
            ("offer-credential", Direction::Sent, State::OfferSent),
            ("request-credential", Direction::Received, State::RequestReceived),
            ("issue-credential", Direction::Sent, State::CredentialIssued),
            ("ack", Direction::Received, State::Done),
        ];
        let mut state = State::Start;
        for (message, direction, expected) in steps {
            state = ISSUE_CREDENTIAL.lookup(state, message, Role::Issuer, direction).unwrap().to;
            assert_eq!(state, expected);
        }
        assert!(ISSUE_CREDENTIAL.is_terminal(state));
    }
}
