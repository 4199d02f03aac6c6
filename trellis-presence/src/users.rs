//! Participant roster: who is here, under what name.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

use crate::attendee::{Attendee, ConnectionStatus};
use crate::error::Result;
use crate::latest::LatestState;
use crate::presence::Presence;
use crate::watch::{PresenceManager, Watch};

/// How a participant describes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    /// Avatar URL.
    pub image: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: None,
        }
    }
}

/// A roster entry: self-description plus live connection status.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub info: UserInfo,
    pub attendee: Attendee,
}

impl User {
    pub fn is_connected(&self) -> bool {
        self.attendee.is_connected()
    }
}

/// Keeps a roster callback registered. See [`UsersManager::on_roster_changed`].
#[must_use = "dropping a RosterWatch immediately removes its handlers"]
#[derive(Debug)]
pub struct RosterWatch {
    watch: Watch,
}

impl RosterWatch {
    pub fn unsubscribe(self) {
        self.watch.unsubscribe();
    }
}

#[derive(Debug, Clone)]
pub struct UsersManager {
    state: LatestState<UserInfo>,
}

impl UsersManager {
    /// Register the users channel `name` on `presence`, publishing `me`.
    pub fn new(presence: &Presence, name: &str, me: UserInfo) -> Result<Self> {
        Ok(Self {
            state: presence.register_latest(name, me)?,
        })
    }

    pub fn update_myself(&self, info: UserInfo) {
        self.state.set_local(info);
    }

    pub fn myself(&self) -> User {
        User {
            info: self.state.local(),
            attendee: self.state.presence().myself(),
        }
    }

    /// Every remote participant that has described itself, connected or not.
    pub fn users(&self) -> Vec<User> {
        roster(&self.state)
    }

    pub fn connected_users(&self) -> Vec<User> {
        self.filtered(ConnectionStatus::Connected)
    }

    /// Participants whose last known description is retained after they
    /// dropped.
    pub fn disconnected_users(&self) -> Vec<User> {
        self.filtered(ConnectionStatus::Disconnected)
    }

    fn filtered(&self, status: ConnectionStatus) -> Vec<User> {
        self.users()
            .into_iter()
            .filter(|user| user.attendee.status == status)
            .collect()
    }

    /// Call `f` with the connected roster whenever a remote description
    /// arrives or an attendee connects or disconnects.
    pub fn on_roster_changed<F>(&self, f: F) -> RosterWatch
    where
        F: FnMut(&[User]) + 'static,
    {
        let f = Rc::new(RefCell::new(f));
        let presence = self.state.presence();

        let notify = |state: LatestState<UserInfo>, f: Rc<RefCell<F>>| {
            move || {
                let connected: Vec<User> = roster(&state)
                    .into_iter()
                    .filter(User::is_connected)
                    .collect();
                if let Ok(mut f) = f.try_borrow_mut() {
                    (&mut *f)(&connected);
                }
            }
        };

        let mut on_update = notify(self.state.clone(), f.clone());
        let mut on_connect = notify(self.state.clone(), f.clone());
        let mut on_disconnect = notify(self.state.clone(), f);

        RosterWatch {
            watch: Watch::from_subscriptions(vec![
                self.state.on_updated(move |_| on_update()),
                presence.on_attendee_connected(move |_| on_connect()),
                presence.on_attendee_disconnected(move |_| on_disconnect()),
            ]),
        }
    }
}

fn roster(state: &LatestState<UserInfo>) -> Vec<User> {
    state
        .remotes()
        .into_iter()
        .map(|remote| User {
            info: remote.value,
            attendee: remote.attendee,
        })
        .collect()
}

impl PresenceManager for UsersManager {
    type Value = UserInfo;

    fn channel(&self) -> &LatestState<UserInfo> {
        &self.state
    }
}
