//! Chats, contacts and messages derived from protocol event batches.
//!
//! A batch is applied under one transaction. Entity rows are upserted by
//! `(session_id, entity id)`; a `messaging-history.set` with `is_latest`
//! replaces the session's whole set.

use std::collections::BTreeSet;

use {
    serde::Serialize,
    serde_json::{Map, Value},
    sqlx::{SqliteConnection, SqlitePool},
    tracing::debug,
};

use {
    switchboard_common::time::now_ms,
    switchboard_protocol::{Chat, Contact, EventBatch, Message, MessageKey},
};

use crate::error::StoreError;

/// Result of applying one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub rows_written: usize,
    /// Conversations that received an upserted message but have no chat row.
    pub orphan_chats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChat {
    pub id: String,
    pub data: Value,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredContact {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub remote_jid: String,
    pub id: String,
    pub from_me: bool,
    pub timestamp: Option<i64>,
    pub data: Value,
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    data: String,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    remote_jid: String,
    id: String,
    from_me: bool,
    timestamp: Option<i64>,
    data: String,
}

/// SQLite-backed store for ingested traffic.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
        for ddl in [
            r#"CREATE TABLE IF NOT EXISTS chats (
                session_id TEXT NOT NULL,
                id         TEXT NOT NULL,
                data       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS contacts (
                session_id TEXT NOT NULL,
                id         TEXT NOT NULL,
                data       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                remote_jid TEXT NOT NULL,
                id         TEXT NOT NULL,
                from_me    INTEGER NOT NULL DEFAULT 0,
                timestamp  INTEGER,
                data       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, remote_jid, id)
            )"#,
        ] {
            sqlx::query(ddl).execute(pool).await?;
        }
        Ok(())
    }

    /// Apply one batch under a single transaction.
    pub async fn apply(&self, session_id: &str, batch: &EventBatch) -> Result<ApplyOutcome, StoreError> {
        let now = now_ms() as i64;
        let mut outcome = ApplyOutcome::default();
        let mut tx = self.pool.begin().await?;

        if let Some(history) = &batch.history_set {
            if history.is_latest {
                delete_session_rows(&mut tx, session_id).await?;
            }
            for chat in &history.chats {
                upsert_chat(&mut tx, session_id, chat, now).await?;
            }
            for contact in &history.contacts {
                upsert_contact(&mut tx, session_id, contact, now).await?;
            }
            for msg in &history.messages {
                upsert_message(&mut tx, session_id, msg, now).await?;
            }
            outcome.rows_written +=
                history.chats.len() + history.contacts.len() + history.messages.len();
        }

        for chat in &batch.chats_upsert {
            upsert_chat(&mut tx, session_id, chat, now).await?;
            outcome.rows_written += 1;
        }
        for chat in &batch.chats_update {
            if merge_entity(&mut tx, "chats", session_id, &chat.id, &chat.fields, now).await? {
                outcome.rows_written += 1;
            }
        }
        for id in &batch.chats_delete {
            sqlx::query("DELETE FROM chats WHERE session_id = ? AND id = ?")
                .bind(session_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for contact in &batch.contacts_upsert {
            upsert_contact(&mut tx, session_id, contact, now).await?;
            outcome.rows_written += 1;
        }
        for contact in &batch.contacts_update {
            if merge_entity(&mut tx, "contacts", session_id, &contact.id, &contact.fields, now).await? {
                outcome.rows_written += 1;
            }
        }

        for msg in &batch.messages_upsert {
            upsert_message(&mut tx, session_id, msg, now).await?;
            outcome.rows_written += 1;
        }
        for update in &batch.messages_update {
            if update_message(&mut tx, session_id, &update.key, now, |data| {
                merge_fields(data, &update.update)
            })
            .await?
            {
                outcome.rows_written += 1;
            }
        }
        for key in &batch.messages_delete {
            sqlx::query("DELETE FROM messages WHERE session_id = ? AND remote_jid = ? AND id = ?")
                .bind(session_id)
                .bind(&key.remote_jid)
                .bind(&key.id)
                .execute(&mut *tx)
                .await?;
        }
        for receipt in &batch.receipts {
            if update_message(&mut tx, session_id, &receipt.key, now, |data| {
                merge_keyed_entry(data, "userReceipt", "userJid", &receipt.receipt)
            })
            .await?
            {
                outcome.rows_written += 1;
            }
        }
        for reaction in &batch.reactions {
            if update_message(&mut tx, session_id, &reaction.key, now, |data| {
                apply_reaction(data, &reaction.reaction)
            })
            .await?
            {
                outcome.rows_written += 1;
            }
        }

        let conversations: BTreeSet<&str> = batch
            .messages_upsert
            .iter()
            .map(|m| m.key.remote_jid.as_str())
            .collect();
        for jid in conversations {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM chats WHERE session_id = ? AND id = ?",
            )
            .bind(session_id)
            .bind(jid)
            .fetch_one(&mut *tx)
            .await?;
            if exists == 0 {
                outcome.orphan_chats.push(jid.to_string());
            }
        }

        tx.commit().await?;
        debug!(session_id, rows = outcome.rows_written, "batch persisted");
        Ok(outcome)
    }

    pub async fn list_chats(&self, session_id: &str) -> Result<Vec<StoredChat>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT id, data, updated_at FROM chats WHERE session_id = ? ORDER BY updated_at DESC, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredChat {
                    id: r.id,
                    data: serde_json::from_str(&r.data)?,
                    updated_at: r.updated_at,
                })
            })
            .collect()
    }

    pub async fn list_contacts(&self, session_id: &str) -> Result<Vec<StoredContact>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT id, data, updated_at FROM contacts WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredContact {
                    id: r.id,
                    data: serde_json::from_str(&r.data)?,
                })
            })
            .collect()
    }

    /// Messages of one conversation, newest first.
    pub async fn list_messages(
        &self,
        session_id: &str,
        remote_jid: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"SELECT remote_jid, id, from_me, timestamp, data FROM messages
               WHERE session_id = ? AND remote_jid = ?
               ORDER BY timestamp DESC, id DESC LIMIT ?"#,
        )
        .bind(session_id)
        .bind(remote_jid)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredMessage {
                    remote_jid: r.remote_jid,
                    id: r.id,
                    from_me: r.from_me,
                    timestamp: r.timestamp,
                    data: serde_json::from_str(&r.data)?,
                })
            })
            .collect()
    }

    pub async fn count_messages(&self, session_id: &str) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Drop every ingested row of a session under one transaction.
    pub async fn purge(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        delete_session_rows(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn delete_session_rows(conn: &mut SqliteConnection, session_id: &str) -> Result<(), sqlx::Error> {
    for table in ["chats", "contacts", "messages"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
            .bind(session_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn entity_json(id: &str, fields: &Map<String, Value>) -> String {
    let mut obj = fields.clone();
    obj.insert("id".into(), Value::String(id.to_string()));
    Value::Object(obj).to_string()
}

async fn upsert_chat(
    conn: &mut SqliteConnection,
    session_id: &str,
    chat: &Chat,
    now: i64,
) -> Result<(), sqlx::Error> {
    upsert_entity(conn, "chats", session_id, &chat.id, &entity_json(&chat.id, &chat.fields), now).await
}

async fn upsert_contact(
    conn: &mut SqliteConnection,
    session_id: &str,
    contact: &Contact,
    now: i64,
) -> Result<(), sqlx::Error> {
    upsert_entity(
        conn,
        "contacts",
        session_id,
        &contact.id,
        &entity_json(&contact.id, &contact.fields),
        now,
    )
    .await
}

async fn upsert_entity(
    conn: &mut SqliteConnection,
    table: &str,
    session_id: &str,
    id: &str,
    data: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"INSERT INTO {table} (session_id, id, data, updated_at) VALUES (?, ?, ?, ?)
           ON CONFLICT(session_id, id) DO UPDATE SET
             data = excluded.data,
             updated_at = excluded.updated_at"#
    ))
    .bind(session_id)
    .bind(id)
    .bind(data)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Merge `fields` into an existing row. Returns false when the row is unknown.
async fn merge_entity(
    conn: &mut SqliteConnection,
    table: &str,
    session_id: &str,
    id: &str,
    fields: &Map<String, Value>,
    now: i64,
) -> Result<bool, StoreError> {
    let existing = sqlx::query_scalar::<_, String>(&format!(
        "SELECT data FROM {table} WHERE session_id = ? AND id = ?"
    ))
    .bind(session_id)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(existing) = existing else {
        return Ok(false);
    };
    let mut data: Value = serde_json::from_str(&existing)?;
    merge_fields(&mut data, fields);
    sqlx::query(&format!(
        "UPDATE {table} SET data = ?, updated_at = ? WHERE session_id = ? AND id = ?"
    ))
    .bind(data.to_string())
    .bind(now)
    .bind(session_id)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

async fn upsert_message(
    conn: &mut SqliteConnection,
    session_id: &str,
    msg: &Message,
    now: i64,
) -> Result<(), StoreError> {
    let data = serde_json::to_string(msg)?;
    sqlx::query(
        r#"INSERT INTO messages (session_id, remote_jid, id, from_me, timestamp, data, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(session_id, remote_jid, id) DO UPDATE SET
             from_me = excluded.from_me,
             timestamp = COALESCE(excluded.timestamp, messages.timestamp),
             data = excluded.data,
             updated_at = excluded.updated_at"#,
    )
    .bind(session_id)
    .bind(&msg.key.remote_jid)
    .bind(&msg.key.id)
    .bind(msg.key.from_me)
    .bind(msg.message_timestamp)
    .bind(data)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Read-modify-write of a stored message. Returns false when it is unknown.
async fn update_message(
    conn: &mut SqliteConnection,
    session_id: &str,
    key: &MessageKey,
    now: i64,
    edit: impl FnOnce(&mut Value),
) -> Result<bool, StoreError> {
    let existing = sqlx::query_scalar::<_, String>(
        "SELECT data FROM messages WHERE session_id = ? AND remote_jid = ? AND id = ?",
    )
    .bind(session_id)
    .bind(&key.remote_jid)
    .bind(&key.id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(existing) = existing else {
        return Ok(false);
    };
    let mut data: Value = serde_json::from_str(&existing)?;
    edit(&mut data);
    sqlx::query(
        "UPDATE messages SET data = ?, updated_at = ? WHERE session_id = ? AND remote_jid = ? AND id = ?",
    )
    .bind(data.to_string())
    .bind(now)
    .bind(session_id)
    .bind(&key.remote_jid)
    .bind(&key.id)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

fn merge_fields(data: &mut Value, fields: &Map<String, Value>) {
    if let Value::Object(obj) = data {
        for (k, v) in fields {
            obj.insert(k.clone(), v.clone());
        }
    }
}

/// Replace the entry of `list` whose `id_field` matches, or append.
fn merge_keyed_entry(data: &mut Value, list: &str, id_field: &str, entry: &Value) {
    let Value::Object(obj) = data else {
        return;
    };
    let items = obj
        .entry(list.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !items.is_array() {
        *items = Value::Array(Vec::new());
    }
    let Value::Array(items) = items else {
        return;
    };
    let wanted = entry.get(id_field);
    match items
        .iter_mut()
        .find(|item| wanted.is_some() && item.get(id_field) == wanted)
    {
        Some(item) => {
            if let (Value::Object(dst), Value::Object(src)) = (item, entry) {
                for (k, v) in src {
                    dst.insert(k.clone(), v.clone());
                }
            }
        },
        None => items.push(entry.clone()),
    }
}

/// One reaction per sender; an empty text removes it.
fn apply_reaction(data: &mut Value, reaction: &Value) {
    let Value::Object(obj) = data else {
        return;
    };
    let items = obj
        .entry("reactions".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(items) = items else {
        return;
    };
    let sender = reaction.get("key");
    items.retain(|r| r.get("key") != sender);
    let removed = reaction
        .get("text")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty);
    if !removed {
        items.push(reaction.clone());
    }
}
