//! Connection states of a remote signer session.

use std::fmt;

/// Progress of turning the connection token into a pubkey and relay list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    /// Directory lookup in flight
    Resolving,
    Resolved,
}

/// Progress of the `connect` handshake with the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `connect` sent, waiting for `ack`
    Handshaking,
    Connected,
}

/// Snapshot of both state machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteSignerState {
    pub resolution: ResolutionState,
    pub connection: ConnectionState,
}

impl fmt::Display for RemoteSignerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.resolution, self.connection)
    }
}
