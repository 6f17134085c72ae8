//! Transport boundary: who is pushing and what they asked for
//!
//! A [`Session`] can only be built by a transport module, from an identity
//! the transport authenticated. Whatever the remote party asked to run is
//! carried as an opaque string and only ever interpreted by the dispatcher.

use std::fmt;

/// An identity established by the transport (TLS client certificate or
/// sshd forced command). Not constructible outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity(String);

impl VerifiedIdentity {
    pub(crate) fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which transport produced the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tls,
    SshForcedCommand,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tls => "tls",
            TransportKind::SshForcedCommand => "ssh",
        }
    }
}

/// One inbound connection, as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    identity: VerifiedIdentity,
    requested: String,
    transport: TransportKind,
    peer: Option<String>,
}

impl Session {
    pub(crate) fn from_transport(
        identity: VerifiedIdentity,
        requested: impl Into<String>,
        transport: TransportKind,
        peer: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identity,
            requested: requested.into(),
            transport,
            peer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &VerifiedIdentity {
        &self.identity
    }

    /// Raw operation string supplied by the remote party. Untrusted.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}
