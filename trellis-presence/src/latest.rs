//! `LatestState<T>`: one slot of ephemeral state per participant.
//!
//! The local slot is written with [`LatestState::set_local`] and is visible
//! to this process immediately. Remote slots are only ever written by the
//! router when a newer value from their owner arrives.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use trellis_core::{Emitter, Subscription};

use crate::attendee::{Attendee, ConnectionId, ConnectionStatus, ParticipantId};
use crate::presence::{ChannelSink, Presence};
use crate::protocol::decode_value;

/// A remote participant's value together with its current attendee record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteValue<T> {
    pub attendee: Attendee,
    pub value: T,
}

struct RemoteSlot<T> {
    value: T,
    /// `None` after a reconnect: the next value is accepted whatever its seq.
    seq: Option<u64>,
}

struct LatestInner<T> {
    name: String,
    presence: Presence,
    local: RefCell<T>,
    seq: Cell<u64>,
    remotes: RefCell<HashMap<ParticipantId, RemoteSlot<T>>>,
    local_updated: Emitter<T>,
    updated: Emitter<RemoteValue<T>>,
}

/// A named broadcast channel. Create with [`Presence::register_latest`].
/// Clones share the same channel.
pub struct LatestState<T> {
    inner: Rc<LatestInner<T>>,
}

impl<T> Clone for LatestState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for LatestState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestState")
            .field("name", &self.inner.name)
            .field("seq", &self.inner.seq.get())
            .field("remotes", &self.inner.remotes.borrow().len())
            .finish()
    }
}

impl<T> LatestState<T>
where
    T: Clone + Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn new(presence: Presence, name: &str, initial: T) -> Self {
        Self {
            inner: Rc::new(LatestInner {
                name: name.to_string(),
                presence,
                local: RefCell::new(initial),
                seq: Cell::new(0),
                remotes: RefCell::new(HashMap::new()),
                local_updated: Emitter::new(),
                updated: Emitter::new(),
            }),
        }
    }

    pub(crate) fn sink(&self) -> Rc<dyn ChannelSink> {
        self.inner.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    /// This participant's current value.
    pub fn local(&self) -> T {
        self.inner.local.borrow().clone()
    }

    /// Read the local value without cloning it.
    pub fn with_local<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.local.borrow())
    }

    /// Replace the local value, fire `local_updated`, and publish it.
    pub fn set_local(&self, value: T) {
        *self.inner.local.borrow_mut() = value.clone();
        let seq = self.inner.seq.get() + 1;
        self.inner.seq.set(seq);

        self.inner.local_updated.emit(&value);
        self.inner.presence.send_state(&self.inner.name, seq, &value);
    }

    /// Every remote value received, whatever its owner's connection status,
    /// ordered by participant.
    pub fn remotes(&self) -> Vec<RemoteValue<T>> {
        let mut values: Vec<RemoteValue<T>> = self
            .inner
            .remotes
            .borrow()
            .iter()
            .map(|(id, slot)| RemoteValue {
                attendee: self.inner.attendee_or_placeholder(*id),
                value: slot.value.clone(),
            })
            .collect();
        values.sort_by_key(|v| v.attendee.participant_id);
        values
    }

    pub fn remote(&self, participant: &ParticipantId) -> Option<T> {
        self.inner
            .remotes
            .borrow()
            .get(participant)
            .map(|slot| slot.value.clone())
    }

    pub fn on_local_updated<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&T) + 'static,
    {
        self.inner.local_updated.subscribe(f)
    }

    /// Fires for every accepted remote value.
    pub fn on_updated<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&RemoteValue<T>) + 'static,
    {
        self.inner.updated.subscribe(f)
    }
}

impl<T> LatestInner<T> {
    fn attendee_or_placeholder(&self, id: ParticipantId) -> Attendee {
        self.presence.attendee(&id).unwrap_or(Attendee {
            participant_id: id,
            connection_id: ConnectionId::unknown(),
            status: ConnectionStatus::Connected,
        })
    }
}

impl<T> ChannelSink for LatestInner<T>
where
    T: Clone + Serialize + DeserializeOwned + 'static,
{
    fn receive(&self, from: ParticipantId, seq: u64, payload: &[u8]) {
        let fresh = match self.remotes.borrow().get(&from) {
            Some(slot) => slot.seq.map_or(true, |last| seq > last),
            None => true,
        };
        if !fresh {
            log::trace!("Ignoring stale {} value from {} (seq {})", self.name, from, seq);
            return;
        }

        let value: T = match decode_value(payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Dropping undecodable {} value from {}: {}", self.name, from, e);
                return;
            }
        };
        self.remotes.borrow_mut().insert(
            from,
            RemoteSlot {
                value: value.clone(),
                seq: Some(seq),
            },
        );

        let update = RemoteValue {
            attendee: self.attendee_or_placeholder(from),
            value,
        };
        self.updated.emit(&update);
    }

    fn reset_sequence(&self, participant: ParticipantId) {
        if let Some(slot) = self.remotes.borrow_mut().get_mut(&participant) {
            slot.seq = None;
        }
    }

    fn resend(&self) {
        let local = self.local.borrow().clone();
        self.presence.send_state(&self.name, self.seq.get(), &local);
    }
}
