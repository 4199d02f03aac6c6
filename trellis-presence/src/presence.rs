//! Participant registry and signal router.
//!
//! A [`Presence`] is one participant's view of the room. It owns the
//! transport, tracks every attendee's connection status, and routes
//! inbound `State` signals to the broadcast channel registered under the
//! signal's channel name.
//!
//! ```text
//! transport.try_recv() ──► Signal::decode ──► Join  ─► attendee registry ─► reply + resend
//!        (pump)                           ├─► Leave ─► attendee Disconnected
//!                                         └─► State ─► channel[name].receive()
//!                                                      (or pending, until registered)
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use trellis_core::{Emitter, Subscription};

use crate::attendee::{Attendee, ConnectionId, ConnectionStatus, ParticipantId};
use crate::error::{PresenceError, Result};
use crate::latest::LatestState;
use crate::protocol::{encode_value, Signal};
use crate::transport::Transport;

// ───────────────────────────────────────────────────────────────────
// Channel routing
// ───────────────────────────────────────────────────────────────────

/// Receiving side of a broadcast channel, as seen by the router.
pub(crate) trait ChannelSink {
    /// A remote value arrived.
    fn receive(&self, from: ParticipantId, seq: u64, payload: &[u8]);

    /// `participant` reconnected; accept its sequence numbers from scratch.
    fn reset_sequence(&self, participant: ParticipantId);

    /// Send the current local value again without bumping its sequence.
    fn resend(&self);
}

/// A `State` signal for a channel nobody registered yet.
struct PendingState {
    seq: u64,
    payload: Vec<u8>,
}

struct PresenceInner {
    me: ParticipantId,
    connection: Cell<ConnectionId>,
    status: Cell<ConnectionStatus>,
    transport: Box<dyn Transport>,
    attendees: RefCell<HashMap<ParticipantId, Attendee>>,
    channels: RefCell<HashMap<String, Weak<dyn ChannelSink>>>,
    pending: RefCell<HashMap<String, HashMap<ParticipantId, PendingState>>>,
    attendee_connected: Emitter<Attendee>,
    attendee_disconnected: Emitter<Attendee>,
}

/// One participant's presence session. Clones share the same session.
#[derive(Clone)]
pub struct Presence {
    inner: Rc<PresenceInner>,
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("me", &self.inner.me)
            .field("status", &self.inner.status.get())
            .field("attendees", &self.inner.attendees.borrow().len())
            .field("channels", &self.inner.channels.borrow().len())
            .finish()
    }
}

impl Presence {
    /// A disconnected session for `me` over `transport`. Call
    /// [`Presence::connect`] to join the room.
    pub fn new<T>(me: ParticipantId, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self {
            inner: Rc::new(PresenceInner {
                me,
                connection: Cell::new(ConnectionId::new()),
                status: Cell::new(ConnectionStatus::Disconnected),
                transport: Box::new(transport),
                attendees: RefCell::new(HashMap::new()),
                channels: RefCell::new(HashMap::new()),
                pending: RefCell::new(HashMap::new()),
                attendee_connected: Emitter::new(),
                attendee_disconnected: Emitter::new(),
            }),
        }
    }

    pub fn me(&self) -> ParticipantId {
        self.inner.me
    }

    /// This participant's own attendee record.
    pub fn myself(&self) -> Attendee {
        Attendee {
            participant_id: self.inner.me,
            connection_id: self.inner.connection.get(),
            status: self.inner.status.get(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.get() == ConnectionStatus::Connected
    }

    pub fn attendee(&self, id: &ParticipantId) -> Option<Attendee> {
        if *id == self.inner.me {
            return Some(self.myself());
        }
        self.inner.attendees.borrow().get(id).copied()
    }

    /// Every known attendee, this participant first.
    pub fn attendees(&self) -> Vec<Attendee> {
        let mut all = vec![self.myself()];
        let mut others: Vec<Attendee> = self.inner.attendees.borrow().values().copied().collect();
        others.sort_by_key(|a| a.participant_id);
        all.extend(others);
        all
    }

    // ─── Connection lifecycle ───────────────────────────────────

    /// Join the room with a fresh connection id, announce ourselves, and
    /// publish every channel's current value.
    pub fn connect(&self) -> Result<ConnectionId> {
        if self.is_connected() {
            return Ok(self.inner.connection.get());
        }
        self.inner.transport.reopen()?;

        let connection = ConnectionId::new();
        self.inner.connection.set(connection);
        self.inner.status.set(ConnectionStatus::Connected);
        log::info!("Participant {} connected ({})", self.inner.me, connection);

        self.send_signal(&Signal::Join {
            participant: self.inner.me,
            connection,
            reply: false,
        });
        self.resend_all();
        Ok(connection)
    }

    /// Leave the room. Remote attendees are marked disconnected until we
    /// hear from them again. Cached remote values are kept.
    pub fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        self.send_signal(&Signal::Leave {
            participant: self.inner.me,
            connection: Some(self.inner.connection.get()),
        });
        self.inner.transport.close();
        self.inner.status.set(ConnectionStatus::Disconnected);
        log::info!("Participant {} disconnected", self.inner.me);

        let dropped: Vec<Attendee> = {
            let mut attendees = self.inner.attendees.borrow_mut();
            let mut dropped = Vec::new();
            for attendee in attendees.values_mut().filter(|a| a.is_connected()) {
                attendee.status = ConnectionStatus::Disconnected;
                dropped.push(*attendee);
            }
            dropped
        };
        for attendee in &dropped {
            self.inner.attendee_disconnected.emit(attendee);
        }
    }

    // ─── Inbound ────────────────────────────────────────────────

    /// Drain every waiting frame from the transport. Returns how many frames
    /// were handled. Malformed frames are logged and skipped.
    pub fn pump(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let frame = self.inner.transport.try_recv()?;
            let Some(frame) = frame else {
                break;
            };
            match Signal::decode(&frame) {
                Ok(signal) => {
                    self.handle_signal(signal);
                    handled += 1;
                }
                Err(e) => log::warn!("Skipping malformed presence frame: {}", e),
            }
        }
        Ok(handled)
    }

    /// Decode and handle one frame.
    pub fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        let signal = Signal::decode(frame)?;
        self.handle_signal(signal);
        Ok(())
    }

    pub fn handle_signal(&self, signal: Signal) {
        // Skip our own messages echoed back by the transport.
        if signal.participant() == self.inner.me {
            return;
        }

        match signal {
            Signal::Join {
                participant,
                connection,
                reply,
            } => self.handle_join(participant, connection, reply),

            Signal::Leave {
                participant,
                connection,
            } => self.handle_leave(participant, connection),

            Signal::State {
                participant,
                channel,
                seq,
                payload,
            } => {
                self.ensure_attendee(participant);
                self.route_state(participant, &channel, seq, payload);
            }
        }
    }

    fn handle_join(&self, participant: ParticipantId, connection: ConnectionId, reply: bool) {
        let (changed, reconnected) = {
            let mut attendees = self.inner.attendees.borrow_mut();
            let entry = attendees.entry(participant).or_insert(Attendee {
                participant_id: participant,
                connection_id: connection,
                status: ConnectionStatus::Disconnected,
            });
            let reconnected = entry.connection_id != connection && !entry.connection_id.is_unknown();
            let changed = reconnected || !entry.is_connected();
            entry.connection_id = connection;
            entry.status = ConnectionStatus::Connected;
            (changed.then_some(*entry), reconnected)
        };

        if reconnected {
            log::debug!("Participant {} reconnected as {}", participant, connection);
            self.reset_sequences(participant);
        }
        if let Some(attendee) = changed {
            self.inner.attendee_connected.emit(&attendee);
        }

        // Answer a fresh join so the newcomer learns about us and our state.
        if !reply && self.is_connected() {
            self.send_signal(&Signal::Join {
                participant: self.inner.me,
                connection: self.inner.connection.get(),
                reply: true,
            });
            self.resend_all();
        }
    }

    fn handle_leave(&self, participant: ParticipantId, connection: Option<ConnectionId>) {
        let left = {
            let mut attendees = self.inner.attendees.borrow_mut();
            match attendees.get_mut(&participant) {
                Some(attendee)
                    if attendee.is_connected()
                        && connection.map_or(true, |c| {
                            // A placeholder never learned its connection.
                            c == attendee.connection_id || attendee.connection_id.is_unknown()
                        }) =>
                {
                    attendee.status = ConnectionStatus::Disconnected;
                    Some(*attendee)
                }
                _ => None,
            }
        };
        if let Some(attendee) = left {
            log::debug!("Participant {} left", participant);
            self.inner.attendee_disconnected.emit(&attendee);
        }
    }

    /// Values from a participant we have not seen join yet create a
    /// connected placeholder.
    fn ensure_attendee(&self, participant: ParticipantId) {
        let created = {
            let mut attendees = self.inner.attendees.borrow_mut();
            if attendees.contains_key(&participant) {
                None
            } else {
                let attendee = Attendee {
                    participant_id: participant,
                    connection_id: ConnectionId::unknown(),
                    status: ConnectionStatus::Connected,
                };
                attendees.insert(participant, attendee);
                Some(attendee)
            }
        };
        if let Some(attendee) = created {
            log::debug!("Placeholder attendee for {}", participant);
            self.inner.attendee_connected.emit(&attendee);
        }
    }

    fn route_state(&self, from: ParticipantId, channel: &str, seq: u64, payload: Vec<u8>) {
        match self.channel(channel) {
            Some(sink) => sink.receive(from, seq, &payload),
            None => {
                let mut pending = self.inner.pending.borrow_mut();
                let slot = pending.entry(channel.to_string()).or_default();
                match slot.get(&from) {
                    Some(existing) if existing.seq >= seq => {}
                    _ => {
                        slot.insert(from, PendingState { seq, payload });
                    }
                }
            }
        }
    }

    fn channel(&self, name: &str) -> Option<Rc<dyn ChannelSink>> {
        self.inner.channels.borrow().get(name).and_then(Weak::upgrade)
    }

    fn live_channels(&self) -> Vec<Rc<dyn ChannelSink>> {
        self.inner
            .channels
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn reset_sequences(&self, participant: ParticipantId) {
        for sink in self.live_channels() {
            sink.reset_sequence(participant);
        }
        for slot in self.inner.pending.borrow_mut().values_mut() {
            slot.remove(&participant);
        }
    }

    fn resend_all(&self) {
        for sink in self.live_channels() {
            sink.resend();
        }
    }

    // ─── Outbound ───────────────────────────────────────────────

    fn send_signal(&self, signal: &Signal) {
        let frame = match signal.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode presence signal: {}", e);
                return;
            }
        };
        if let Err(e) = self.inner.transport.send(frame) {
            log::warn!("Presence transport send failed: {}", e);
        }
    }

    /// Publish one channel value. Writes while disconnected are dropped.
    pub(crate) fn send_state<T: Serialize>(&self, channel: &str, seq: u64, value: &T) {
        if !self.is_connected() {
            log::debug!("Dropping write to {} while disconnected", channel);
            return;
        }
        match encode_value(value) {
            Ok(payload) => self.send_signal(&Signal::State {
                participant: self.inner.me,
                channel: channel.to_string(),
                seq,
                payload,
            }),
            Err(e) => log::warn!("Failed to encode value for {}: {}", channel, e),
        }
    }

    // ─── Channels & events ──────────────────────────────────────

    /// Register a broadcast channel named `name` whose local value starts as
    /// `initial`. Values already received for `name` are replayed into it.
    pub fn register_latest<T>(&self, name: &str, initial: T) -> Result<LatestState<T>>
    where
        T: Clone + Serialize + DeserializeOwned + 'static,
    {
        if self.channel(name).is_some() {
            return Err(PresenceError::DuplicateChannel(name.to_string()));
        }

        let state = LatestState::new(self.clone(), name, initial);
        let sink: Rc<dyn ChannelSink> = state.sink();
        self.inner
            .channels
            .borrow_mut()
            .insert(name.to_string(), Rc::downgrade(&sink));
        log::debug!("Registered channel {}", name);

        let buffered = self.inner.pending.borrow_mut().remove(name);
        if let Some(buffered) = buffered {
            for (from, pending) in buffered {
                sink.receive(from, pending.seq, &pending.payload);
            }
        }
        sink.resend();
        Ok(state)
    }

    pub fn on_attendee_connected<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&Attendee) + 'static,
    {
        self.inner.attendee_connected.subscribe(f)
    }

    pub fn on_attendee_disconnected<F>(&self, f: F) -> Subscription
    where
        F: FnMut(&Attendee) + 'static,
    {
        self.inner.attendee_disconnected.subscribe(f)
    }
}
