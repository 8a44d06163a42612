//! Protocol states, roles and message directions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Union of every protocol's states; each protocol table uses a subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Start,
    // DID exchange
    RequestSent,
    RequestReceived,
    ResponseSent,
    ResponseReceived,
    Completed,
    // Credential and presentation exchange
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    CredentialIssued,
    CredentialReceived,
    PresentationSent,
    PresentationReceived,
    Done,
    // Mediation
    Granted,
    Denied,
    /// Ended by a problem report
    Abandoned,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::RequestSent => "request-sent",
            State::RequestReceived => "request-received",
            State::ResponseSent => "response-sent",
            State::ResponseReceived => "response-received",
            State::Completed => "completed",
            State::ProposalSent => "proposal-sent",
            State::ProposalReceived => "proposal-received",
            State::OfferSent => "offer-sent",
            State::OfferReceived => "offer-received",
            State::CredentialIssued => "credential-issued",
            State::CredentialReceived => "credential-received",
            State::PresentationSent => "presentation-sent",
            State::PresentationReceived => "presentation-received",
            State::Done => "done",
            State::Granted => "granted",
            State::Denied => "denied",
            State::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Inviter,
    Invitee,
    Issuer,
    Holder,
    Prover,
    Verifier,
    Requester,
    Mediator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Inviter => "inviter",
            Role::Invitee => "invitee",
            Role::Issuer => "issuer",
            Role::Holder => "holder",
            Role::Prover => "prover",
            Role::Verifier => "verifier",
            Role::Requester => "requester",
            Role::Mediator => "mediator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Sent,
    Received,
}
