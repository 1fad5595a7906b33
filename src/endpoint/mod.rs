//! Shared endpoint state: the local/remote half-state machine common to
//! Connection, Session, and Link, plus the "modified" membership flag the
//! outbound pipeline walks.

use fe2o3_amqp_types::definitions;

/// One half (local or remote) of an endpoint's lifecycle.
///
/// Local bits transition strictly `Uninit -> Active -> Closed`; remote bits
/// mirror whatever the peer announces. Once both halves read `Closed`, the
/// endpoint is terminal and no further frames may reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalfState {
    #[default]
    Uninit,
    Active,
    Closed,
}

/// An endpoint's `(local, remote)` half-state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointState {
    pub local: HalfState,
    pub remote: HalfState,
}

impl EndpointState {
    pub fn is_local_active_or_later(&self) -> bool {
        self.local != HalfState::Uninit
    }

    pub fn is_terminal(&self) -> bool {
        self.local == HalfState::Closed && self.remote == HalfState::Closed
    }
}

/// `(name, description, info)` error condition record carried by an endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Condition {
    pub error: Option<definitions::Error>,
}

impl Condition {
    pub fn set(&mut self, error: definitions::Error) {
        self.error = Some(error);
    }
}

/// The fields every endpoint (Connection, Session, Link) carries, mirroring
/// the abstract "Endpoint" base of the data model: half-states, local/remote
/// conditions, and the `modified` membership flag.
#[derive(Debug, Default)]
pub struct EndpointHeader {
    pub state: EndpointState,
    pub local_condition: Condition,
    pub remote_condition: Condition,
    /// `modified ⇔ endpoint ∈ Connection::modified`.
    pub modified: bool,
}

impl EndpointHeader {
    pub fn mark_modified(&mut self) -> bool {
        let was_modified = self.modified;
        self.modified = true;
        !was_modified
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }
}

/// A reference into one of the three endpoint kinds, used where the outbound
/// pipeline walks `modified` over endpoints of mixed kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRef {
    Connection,
    Session(crate::session::SessionId),
    Link(crate::session::SessionId, crate::link::LinkId),
}
