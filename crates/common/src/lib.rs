//! Identity and status types shared by every switchboard crate.

pub mod time;
pub mod types;

pub use types::{InvalidSessionId, SessionId, SessionStatus};
