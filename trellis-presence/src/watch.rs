//! Subscribe to a manager's channel and its attendees in one call.

use trellis_core::Subscription;

use crate::attendee::Attendee;
use crate::latest::{LatestState, RemoteValue};
use crate::presence::Presence;

/// A manager built on one broadcast channel.
pub trait PresenceManager {
    type Value: Clone + serde::Serialize + serde::de::DeserializeOwned + 'static;

    fn channel(&self) -> &LatestState<Self::Value>;

    fn presence(&self) -> &Presence {
        self.channel().presence()
    }
}

/// Owns a group of subscriptions; dropping it removes every handler.
#[must_use = "dropping a Watch immediately removes its handlers"]
#[derive(Debug, Default)]
pub struct Watch {
    subscriptions: Vec<Subscription>,
}

impl Watch {
    pub(crate) fn from_subscriptions(subscriptions: Vec<Subscription>) -> Self {
        Self { subscriptions }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn unsubscribe(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

/// Run `on_remote` for every accepted remote value, `on_local` for every
/// local write, and `on_disconnect` whenever an attendee drops.
pub fn watch<M, R, L, D>(manager: &M, on_remote: R, on_local: L, on_disconnect: D) -> Watch
where
    M: PresenceManager,
    R: FnMut(&RemoteValue<M::Value>) + 'static,
    L: FnMut(&M::Value) + 'static,
    D: FnMut(&Attendee) + 'static,
{
    let channel = manager.channel();
    Watch::from_subscriptions(vec![
        channel.on_updated(on_remote),
        channel.on_local_updated(on_local),
        manager.presence().on_attendee_disconnected(on_disconnect),
    ])
}
