//! Capability surface of the external messaging protocol client.
//!
//! The supervisor only ever talks to a [`Connector`] and the
//! [`ProtocolClient`] handles it yields. Events arrive as one
//! [`EventBatch`] per protocol tick so that related updates (a message
//! upsert plus its chat upsert from the same frame) are applied together.

pub mod bridge;
pub mod client;
pub mod disconnect;
pub mod error;
pub mod events;

pub use {
    bridge::BridgeConnector,
    client::{
        CREDS_BLOB_ID, ClientConfig, ClientConnection, Connector, FlowControl, KeyStore,
        ProtocolClient, ReadyState, SocketOptions,
    },
    disconnect::DisconnectReason,
    error::ProtocolError,
    events::{
        Chat, ConnectionState, ConnectionUpdate, Contact, CredsUpdate, EventBatch, HistorySet,
        Message, MessageKey, MessageUpdate, Reaction, ReceiptUpdate, creds_registered,
    },
};
