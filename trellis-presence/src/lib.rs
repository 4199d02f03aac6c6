//! # trellis-presence: ephemeral session state for a shared canvas
//!
//! Who is in the room, what each participant has selected, what they are
//! dragging right now, and how they present themselves. None of it is
//! persisted: every value lives in a per-participant broadcast channel and
//! is replayed to late joiners by its owner.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Signal frames    ┌──────────────┐
//! │ Presence (A) │ ◄────────────────► │ Presence (B) │
//! │  attendees   │   (LocalBus or     │  attendees   │
//! │  channels    │    any Transport)  │  channels    │
//! └──────┬───────┘                    └──────────────┘
//!        │ LatestState<T> per channel name
//!        ▼
//! ┌───────────────────────────────────────────────┐
//! │ SelectionManager · DragManager · UsersManager │
//! └──────────────────────┬────────────────────────┘
//!                        │ CanvasSession
//!                        ▼
//!           trellis_core::Document + UndoRedo + BranchSession
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `Signal` frames
//! - [`transport`]: `Transport` trait and the in-process `LocalBus`
//! - [`presence`]: attendee registry and channel router
//! - [`latest`]: `LatestState<T>` broadcast channel
//! - [`selection`], [`drag`], [`users`]: channel managers
//! - [`session`]: `CanvasSession` facade and `SessionConfig`

pub mod attendee;
pub mod drag;
pub mod error;
pub mod latest;
pub mod presence;
pub mod protocol;
pub mod selection;
pub mod session;
pub mod transport;
pub mod users;
pub mod watch;

pub use attendee::{Attendee, ConnectionId, ConnectionStatus, ParticipantId};
pub use drag::{DragManager, DragPreview};
pub use error::{PresenceError, Result, TransportError};
pub use latest::{LatestState, RemoteValue};
pub use presence::Presence;
pub use protocol::Signal;
pub use selection::{SelectionEntry, SelectionKind, SelectionManager};
pub use session::{CanvasSession, SessionConfig};
pub use transport::{BusEndpoint, BusStats, LocalBus, Transport};
pub use users::{RosterWatch, User, UserInfo, UsersManager};
pub use watch::{watch, PresenceManager, Watch};
