//! Participant identity and connection status.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of a participant across reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One connection of a participant. A reconnect gets a fresh id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Placeholder for a participant heard from before its `Join`.
    pub fn unknown() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
}

impl Attendee {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_connection() {
        assert!(ConnectionId::unknown().is_unknown());
        assert!(!ConnectionId::new().is_unknown());
    }

    #[test]
    fn test_attendee_is_connected() {
        let mut attendee = Attendee {
            participant_id: ParticipantId::new(),
            connection_id: ConnectionId::new(),
            status: ConnectionStatus::Connected,
        };
        assert!(attendee.is_connected());
        attendee.status = ConnectionStatus::Disconnected;
        assert!(!attendee.is_connected());
    }
}
