//! Session broadcast engine.
//!
//! Tracks which members belong to a session, reconciles their position updates
//! into a per-session snapshot and fans that snapshot out to every connected
//! member on a fixed tick, whether the process runs alone or as one of many
//! replicas sharing a backplane.

pub mod distributed;
pub mod fanout;
pub mod position;
pub mod queue;
pub mod registry;

use crate::db::backplane::BackplaneError;

pub use fanout::{Frame, MemberConnection, SessionBroadcast};
pub use queue::{EventQueue, QueueBackend, QueueBuilder, SessionClosed};
pub use registry::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// The member cannot be admitted: a guessed id could collide with one
    /// issued by another replica.
    #[error("could not allocate a member id for session {session_id}")]
    MemberIdAllocation {
        session_id: String,
        #[source]
        source: BackplaneError,
    },

    #[error("could not subscribe to session {session_id}")]
    Subscribe {
        session_id: String,
        #[source]
        source: BackplaneError,
    },

    #[error("session {0} is closed")]
    SessionClosed(String),
}
