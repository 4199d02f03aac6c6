//! Binary wire protocol for presence signals.
//!
//! Every frame on a transport is one bincode-encoded [`Signal`]:
//! ```text
//! Join  { participant, connection, reply }       announce / answer a join
//! Leave { participant, connection? }             connection ended
//! State { participant, channel, seq, payload }   one channel's latest value
//! ```
//! `payload` is itself the bincode encoding of the channel's value type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::attendee::{ConnectionId, ParticipantId};
use crate::error::{PresenceError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// A participant (re)connected. Receivers answer a non-reply join with
    /// their own `Join { reply: true }` and a resend of their state.
    Join {
        participant: ParticipantId,
        connection: ConnectionId,
        reply: bool,
    },

    /// `connection: None` ends whatever connection the participant has.
    Leave {
        participant: ParticipantId,
        connection: Option<ConnectionId>,
    },

    State {
        participant: ParticipantId,
        channel: String,
        /// Per-sender, per-channel sequence number.
        seq: u64,
        payload: Vec<u8>,
    },
}

impl Signal {
    pub fn participant(&self) -> ParticipantId {
        match self {
            Signal::Join { participant, .. } => *participant,
            Signal::Leave { participant, .. } => *participant,
            Signal::State { participant, .. } => *participant,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_value(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_value(bytes)
    }
}

pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| PresenceError::Encode(e.to_string()))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PresenceError::Decode(e.to_string()))?;
    Ok(value)
}
