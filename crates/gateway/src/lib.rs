//! HTTP control surface of one worker.
//!
//! A thin axum layer over [`switchboard_sessions::SessionManager`]: every
//! route maps onto one manager operation and every manager error onto one
//! status code.

pub mod error;
pub mod server;
pub mod state;

pub use {
    error::ApiError,
    server::{build_worker_app, serve_worker},
    state::{GatewayState, WorkerIdentity},
};
