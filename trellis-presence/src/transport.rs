//! Frame transports.
//!
//! [`Transport`] is the narrow contract [`crate::Presence`] needs: send a
//! frame to every participant, and poll for inbound frames without blocking.
//! [`LocalBus`] implements it in-process on a tokio broadcast channel, which
//! gives every endpoint an independent receiver buffering up to `capacity`
//! frames.
//!
//! ```text
//! endpoint A ──send──► broadcast::Sender<Arc<Vec<u8>>> ──► endpoint A (own frame)
//!                                                      ├──► endpoint B
//!                                                      └──► endpoint C
//! ```

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::attendee::ParticipantId;
use crate::error::TransportError;
use crate::protocol::Signal;

/// Delivers encoded frames between participants.
///
/// Frames sent by an endpoint may be echoed back to it; receivers skip
/// their own frames.
pub trait Transport {
    /// Hand a frame to every connected participant. Frames sent while the
    /// transport is closed are dropped.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound frame, or `None` when nothing is waiting.
    fn try_recv(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Re-establish a closed transport.
    fn reopen(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub endpoints: usize,
}

#[derive(Default)]
struct AtomicBusStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// In-process fan-out shared by every participant in a room.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    stats: Arc<AtomicBusStats>,
}

impl LocalBus {
    /// `capacity` is how many frames each endpoint buffers before it starts
    /// lagging and losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    /// Open an endpoint for `participant`. It only sees frames sent after
    /// this call.
    pub fn connect(&self, participant: ParticipantId) -> BusEndpoint {
        BusEndpoint {
            participant,
            sender: self.sender.clone(),
            receiver: RefCell::new(self.sender.subscribe()),
            stats: self.stats.clone(),
            open: Cell::new(true),
        }
    }

    /// Send raw bytes to every endpoint. Returns the number of receivers.
    pub fn broadcast_raw(&self, frame: Vec<u8>) -> usize {
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Arc::new(frame)).unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            endpoints: self.sender.receiver_count(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One participant's handle on a [`LocalBus`].
pub struct BusEndpoint {
    participant: ParticipantId,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    receiver: RefCell<broadcast::Receiver<Arc<Vec<u8>>>>,
    stats: Arc<AtomicBusStats>,
    open: Cell<bool>,
}

impl BusEndpoint {
    pub fn participant(&self) -> ParticipantId {
        self.participant
    }
}

impl Transport for BusEndpoint {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.open.get() {
            log::debug!("Dropping frame from {}: endpoint closed", self.participant);
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the frame simply reaches nobody.
        let _ = self.sender.send(Arc::new(frame));
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.open.get() {
            return Ok(None);
        }
        let mut receiver = self.receiver.borrow_mut();
        loop {
            match receiver.try_recv() {
                Ok(frame) => {
                    return Ok(Some(Arc::try_unwrap(frame).unwrap_or_else(|f| (*f).clone())))
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("Endpoint {} lagged, {} frame(s) lost", self.participant, missed);
                    self.stats.frames_dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(TryRecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    /// Resubscribe. Frames sent while closed are not delivered.
    fn reopen(&self) -> Result<(), TransportError> {
        if !self.open.get() {
            *self.receiver.borrow_mut() = self.sender.subscribe();
            self.open.set(true);
        }
        Ok(())
    }

    /// Stop sending and receiving, and tell the room this participant left.
    fn close(&self) {
        if !self.open.replace(false) {
            return;
        }
        let leave = Signal::Leave {
            participant: self.participant,
            connection: None,
        };
        match leave.encode() {
            Ok(frame) => {
                let _ = self.sender.send(Arc::new(frame));
            }
            Err(e) => log::warn!("Failed to encode leave for {}: {}", self.participant, e),
        }
        log::debug!("Endpoint {} closed", self.participant);
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

impl Drop for BusEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
