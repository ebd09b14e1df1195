//! Events emitted by the protocol client, grouped per tick.

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::disconnect::DisconnectReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// One `connection.update` tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    /// Fresh pairing QR payload.
    pub qr: Option<String>,
    pub last_disconnect: Option<DisconnectReason>,
    pub is_new_login: Option<bool>,
}

impl ConnectionUpdate {
    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            ..Default::default()
        }
    }

    pub fn closed(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(reason),
            ..Default::default()
        }
    }
}

/// A `creds.update` tick: the full, current credential document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredsUpdate {
    pub creds: Value,
}

impl CredsUpdate {
    /// Credentials are confirmed once the service has assigned an identity
    /// or marked the device registered.
    pub fn is_registered(&self) -> bool {
        creds_registered(&self.creds)
    }
}

/// Whether a credential document belongs to a paired device.
pub fn creds_registered(creds: &Value) -> bool {
    creds.get("registered").and_then(Value::as_bool) == Some(true)
        || creds.get("me").is_some_and(|me| !me.is_null())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
}

/// Chat record. Everything besides `id` is kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    pub update: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptUpdate {
    pub key: MessageKey,
    pub receipt: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub key: MessageKey,
    pub reaction: Value,
}

/// `messaging-history.set`: a history sync chunk. With `is_latest` the
/// chunk is the complete, current state for the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySet {
    pub chats: Vec<Chat>,
    pub contacts: Vec<Contact>,
    pub messages: Vec<Message>,
    pub is_latest: bool,
}

/// Everything the client produced since the previous flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBatch {
    #[serde(rename = "connection.update", skip_serializing_if = "Option::is_none")]
    pub connection_update: Option<ConnectionUpdate>,
    #[serde(rename = "creds.update", skip_serializing_if = "Option::is_none")]
    pub creds_update: Option<CredsUpdate>,
    #[serde(rename = "messaging-history.set", skip_serializing_if = "Option::is_none")]
    pub history_set: Option<HistorySet>,
    #[serde(rename = "chats.upsert", skip_serializing_if = "Vec::is_empty")]
    pub chats_upsert: Vec<Chat>,
    #[serde(rename = "chats.update", skip_serializing_if = "Vec::is_empty")]
    pub chats_update: Vec<Chat>,
    #[serde(rename = "chats.delete", skip_serializing_if = "Vec::is_empty")]
    pub chats_delete: Vec<String>,
    #[serde(rename = "contacts.upsert", skip_serializing_if = "Vec::is_empty")]
    pub contacts_upsert: Vec<Contact>,
    #[serde(rename = "contacts.update", skip_serializing_if = "Vec::is_empty")]
    pub contacts_update: Vec<Contact>,
    #[serde(rename = "messages.upsert", skip_serializing_if = "Vec::is_empty")]
    pub messages_upsert: Vec<Message>,
    #[serde(rename = "messages.update", skip_serializing_if = "Vec::is_empty")]
    pub messages_update: Vec<MessageUpdate>,
    #[serde(rename = "messages.delete", skip_serializing_if = "Vec::is_empty")]
    pub messages_delete: Vec<MessageKey>,
    #[serde(rename = "message-receipt.update", skip_serializing_if = "Vec::is_empty")]
    pub receipts: Vec<ReceiptUpdate>,
    #[serde(rename = "messages.reaction", skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
}

impl EventBatch {
    pub fn connection(update: ConnectionUpdate) -> Self {
        Self {
            connection_update: Some(update),
            ..Default::default()
        }
    }

    /// Whether the batch carries anything the ingestion store persists.
    pub fn has_store_events(&self) -> bool {
        self.history_set.is_some()
            || !self.chats_upsert.is_empty()
            || !self.chats_update.is_empty()
            || !self.chats_delete.is_empty()
            || !self.contacts_upsert.is_empty()
            || !self.contacts_update.is_empty()
            || !self.messages_upsert.is_empty()
            || !self.messages_update.is_empty()
            || !self.messages_delete.is_empty()
            || !self.receipts.is_empty()
            || !self.reactions.is_empty()
    }
}
