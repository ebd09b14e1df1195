//! Session lifecycle on one worker.
//!
//! [`SessionManager`] owns the registry of live sessions, drives one
//! supervisor task per protocol connection, and decides after every close
//! whether to reconnect (with backoff and cooldown) or tear the session down.

pub mod backoff;
pub mod bus;
pub mod clock;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod registry;
mod supervisor;

pub use {
    backoff::{CloseDecision, ReconnectPolicy, RetryState},
    bus::{EventBus, SessionEvent, Subscription},
    clock::{Clock, Jitter, ManualClock, SystemClock, fixed_jitter, random_jitter},
    error::SessionError,
    handshake::{HandshakeMessage, HandshakeMode, HandshakeReply},
    manager::{CreateOptions, CreateOutcome, ManagerConfig, SessionManager},
    registry::{LiveConnection, SessionHandle, SessionRegistry, SessionSummary},
};
