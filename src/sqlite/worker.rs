//! Worker thread owning one rusqlite connection.
//!
//! rusqlite handles and prepared statements are `!Send`, so the connection lives on a dedicated
//! thread and every engine call is a [`channel::Command`] answered over a oneshot.

mod channel;
mod connection;
mod dispatcher;
mod manager;
mod session;

pub use connection::SqliteHandle;
pub(crate) use manager::open_flags;
