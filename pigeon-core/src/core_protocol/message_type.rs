//! Message type URIs
//!
//! A type URI is `<prefix><protocol>/<version>/<name>`. Inbound URIs are
//! accepted under any configured prefix and any minor version of a supported
//! major version; outbound URIs use the single emit prefix.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const PROBLEM_REPORT: &str = "problem-report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFamily {
    DidExchange,
    IssueCredential,
    PresentProof,
    CoordinateMediation,
    Routing,
    ReportProblem,
}

impl ProtocolFamily {
    pub const ALL: [ProtocolFamily; 6] = [
        ProtocolFamily::DidExchange,
        ProtocolFamily::IssueCredential,
        ProtocolFamily::PresentProof,
        ProtocolFamily::CoordinateMediation,
        ProtocolFamily::Routing,
        ProtocolFamily::ReportProblem,
    ];

    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolFamily::DidExchange => "didexchange",
            ProtocolFamily::IssueCredential => "issue-credential",
            ProtocolFamily::PresentProof => "present-proof",
            ProtocolFamily::CoordinateMediation => "coordinate-mediation",
            ProtocolFamily::Routing => "routing",
            ProtocolFamily::ReportProblem => "report-problem",
        }
    }

    pub fn version(&self) -> (u32, u32) {
        match self {
            ProtocolFamily::IssueCredential | ProtocolFamily::PresentProof => (2, 0),
            _ => (1, 0),
        }
    }

    /// Message names understood in this family
    pub fn message_names(&self) -> &'static [&'static str] {
        match self {
            ProtocolFamily::DidExchange => &["request", "response", "complete", PROBLEM_REPORT],
            ProtocolFamily::IssueCredential => &[
                "propose-credential",
                "offer-credential",
                "request-credential",
                "issue-credential",
                "ack",
                PROBLEM_REPORT,
            ],
            ProtocolFamily::PresentProof => &[
                "propose-presentation",
                "request-presentation",
                "presentation",
                "ack",
                PROBLEM_REPORT,
            ],
            ProtocolFamily::CoordinateMediation => &[
                "mediate-request",
                "mediate-grant",
                "mediate-deny",
                "keylist-update",
                "keylist-update-response",
                "keylist-query",
                "keylist",
                PROBLEM_REPORT,
            ],
            ProtocolFamily::Routing => &["forward"],
            ProtocolFamily::ReportProblem => &[PROBLEM_REPORT],
        }
    }

    /// Name used on the wire where it differs from the internal name
    fn wire_name(&self, name: &'static str) -> &'static str {
        match (self, name) {
            (ProtocolFamily::DidExchange, PROBLEM_REPORT) => "problem_report",
            _ => name,
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.version();
        write!(f, "{}/{}.{}", self.protocol(), major, minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub family: ProtocolFamily,
    /// Internal message name, e.g. `offer-credential`
    pub name: &'static str,
}

impl MessageType {
    pub fn new(family: ProtocolFamily, name: &'static str) -> Self {
        Self { family, name }
    }

    pub fn is_problem_report(&self) -> bool {
        self.name == PROBLEM_REPORT
    }
}

/// Resolves and emits message type URIs
#[derive(Debug, Clone)]
pub struct MessageTypeRegistry {
    accepted_prefixes: Vec<String>,
    emit_prefix: String,
    /// (protocol, major, wire name) -> message type
    known: HashMap<(&'static str, u32, &'static str), MessageType>,
}

impl MessageTypeRegistry {
    pub fn new(mut accepted_prefixes: Vec<String>, emit_prefix: impl Into<String>) -> Self {
        // Longest prefix first so nested prefixes resolve to the most specific
        accepted_prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));

        let mut known = HashMap::new();
        for family in ProtocolFamily::ALL {
            let (major, _) = family.version();
            for &name in family.message_names() {
                let message_type = MessageType::new(family, name);
                known.insert((family.protocol(), major, family.wire_name(name)), message_type);
                known.insert((family.protocol(), major, name), message_type);
            }
        }

        Self { accepted_prefixes, emit_prefix: emit_prefix.into(), known }
    }

    pub fn from_config(config: &crate::config::DispatchConfig) -> Self {
        Self::new(config.accepted_prefixes.clone(), config.emit_prefix.clone())
    }

    pub fn emit_prefix(&self) -> &str {
        &self.emit_prefix
    }

    /// Map an inbound URI to a known message type
    pub fn resolve(&self, uri: &str) -> Option<MessageType> {
        let rest = self.accepted_prefixes.iter().find_map(|p| uri.strip_prefix(p.as_str()))?;
        let mut parts = rest.splitn(3, '/');
        let protocol = parts.next()?;
        let version = parts.next()?;
        let name = parts.next()?;

        let major: u32 = version.split('.').next()?.parse().ok()?;
        self.known.get(&(protocol, major, name)).copied()
    }

    /// Emitted URI for a message
    pub fn qualify(&self, message_type: MessageType) -> String {
        format!(
            "{}{}/{}",
            self.emit_prefix,
            message_type.family,
            message_type.family.wire_name(message_type.name)
        )
    }

    pub fn uri(&self, family: ProtocolFamily, name: &'static str) -> String {
        self.qualify(MessageType::new(family, name))
    }
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::from_config(&crate::config::DispatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_under_every_prefix() {
        let registry = MessageTypeRegistry::default();
        let expected = MessageType::new(ProtocolFamily::IssueCredential, "offer-credential");

        assert_eq!(
            registry.resolve("https://didcomm.org/issue-credential/2.0/offer-credential"),
            Some(expected)
        );
        assert_eq!(
            registry.resolve("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/issue-credential/2.0/offer-credential"),
            Some(expected)
        );
        assert_eq!(registry.resolve("https://example.org/issue-credential/2.0/offer-credential"), None);
    }

    #[test]
    fn test_minor_versions_are_compatible() {
        let registry = MessageTypeRegistry::default();
        assert!(registry.resolve("https://didcomm.org/didexchange/1.1/request").is_some());
        assert!(registry.resolve("https://didcomm.org/didexchange/2.0/request").is_none());
        assert!(registry.resolve("https://didcomm.org/didexchange/x/request").is_none());
    }

    #[test]
    fn test_unknown_names_do_not_resolve() {
        let registry = MessageTypeRegistry::default();
        assert!(registry.resolve("https://didcomm.org/present-proof/2.0/teleport").is_none());
        assert!(registry.resolve("https://didcomm.org/present-proof").is_none());
    }

    #[test]
    fn test_qualify_uses_wire_names() {
        let registry = MessageTypeRegistry::default();
        let report = MessageType::new(ProtocolFamily::DidExchange, PROBLEM_REPORT);
        let uri = registry.qualify(report);

        assert_eq!(uri, "https://didcomm.org/didexchange/1.0/problem_report");
        assert_eq!(registry.resolve(&uri), Some(report));
        assert_eq!(
            registry.uri(ProtocolFamily::Routing, "forward"),
            "https://didcomm.org/routing/1.0/forward"
        );
    }
}
