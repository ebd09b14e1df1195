//! Per-session credential blobs keyed by `(session_id, blob_id)`.

use {async_trait::async_trait, serde_json::Value, sqlx::SqlitePool, tracing::warn};

use {
    switchboard_common::time::now_ms,
    switchboard_protocol::{CREDS_BLOB_ID, KeyStore},
};

use crate::error::StoreError;

/// Map a blob id to a storage-safe key.
///
/// Path separators become `__` and colons become `-`. The mapping is not
/// reversible, only stable between writes and reads.
pub fn canonical_blob_id(blob_id: &str) -> String {
    blob_id.replace(['/', '\\'], "__").replace(':', "-")
}

/// SQLite-backed credential store.
#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS credentials (
                session_id TEXT NOT NULL,
                blob_id    TEXT NOT NULL,
                data       BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, blob_id)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Read a blob. Failures are logged and reported as absent, so callers
    /// fall back to a fresh authentication.
    pub async fn get(&self, session_id: &str, blob_id: &str) -> Option<Vec<u8>> {
        match sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM credentials WHERE session_id = ? AND blob_id = ?",
        )
        .bind(session_id)
        .bind(canonical_blob_id(blob_id))
        .fetch_optional(&self.pool)
        .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id, blob_id, error = %e, "credential read failed, starting fresh");
                None
            },
        }
    }

    /// Idempotent upsert, last writer wins.
    pub async fn set(&self, session_id: &str, blob_id: &str, data: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO credentials (session_id, blob_id, data, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(session_id, blob_id) DO UPDATE SET
                 data = excluded.data,
                 updated_at = excluded.updated_at"#,
        )
        .bind(session_id)
        .bind(canonical_blob_id(blob_id))
        .bind(data)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: deleting an absent blob succeeds.
    pub async fn delete(&self, session_id: &str, blob_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM credentials WHERE session_id = ? AND blob_id = ?")
            .bind(session_id)
            .bind(canonical_blob_id(blob_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every blob of a session. Returns the number of rows removed.
    pub async fn wipe(&self, session_id: &str) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM credentials WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub fn for_session(&self, session_id: &str) -> SessionKeys {
        SessionKeys {
            store: self.clone(),
            session_id: session_id.to_string(),
        }
    }
}

/// A [`CredentialStore`] view scoped to one session.
#[derive(Clone)]
pub struct SessionKeys {
    store: CredentialStore,
    session_id: String,
}

impl SessionKeys {
    /// Stored credential document, if present and parseable.
    pub async fn load_creds(&self) -> Option<Value> {
        let raw = self.store.get(&self.session_id, CREDS_BLOB_ID).await?;
        match serde_json::from_slice(&raw) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "stored creds unreadable, starting fresh");
                None
            },
        }
    }

    pub async fn save_creds(&self, creds: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(creds)?;
        self.store.set(&self.session_id, CREDS_BLOB_ID, &raw).await
    }
}

#[async_trait]
impl KeyStore for SessionKeys {
    async fn get(&self, blob_id: &str) -> Option<Vec<u8>> {
        self.store.get(&self.session_id, blob_id).await
    }

    async fn set(&self, blob_id: &str, data: &[u8]) -> anyhow::Result<()> {
        Ok(self.store.set(&self.session_id, blob_id, data).await?)
    }

    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        Ok(self.store.delete(&self.session_id, blob_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CredentialStore {
        CredentialStore::new(crate::connect_in_memory().await.unwrap())
    }

    #[test]
    fn canonicalizes_unsafe_characters() {
        assert_eq!(canonical_blob_id("session-123:4.0"), "session-123-4.0");
        assert_eq!(canonical_blob_id("app-state/sync:key"), "app-state__sync-key");
        assert_eq!(canonical_blob_id("creds"), "creds");
    }

    #[tokio::test]
    async fn set_get_last_writer_wins() {
        let store = store().await;
        assert!(store.get("s1", "pre-key-1").await.is_none());

        store.set("s1", "pre-key-1", b"one").await.unwrap();
        store.set("s1", "pre-key-1", b"two").await.unwrap();
        assert_eq!(store.get("s1", "pre-key-1").await.as_deref(), Some(&b"two"[..]));
        assert!(store.get("s2", "pre-key-1").await.is_none());
    }

    #[tokio::test]
    async fn colon_ids_read_back_consistently() {
        let store = store().await;
        store.set("s1", "session:123.0", b"x").await.unwrap();
        assert_eq!(store.get("s1", "session:123.0").await.as_deref(), Some(&b"x"[..]));
        assert_eq!(store.get("s1", "session-123.0").await.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store().await;
        store.set("s1", "k", b"v").await.unwrap();
        store.delete("s1", "k").await.unwrap();
        store.delete("s1", "k").await.unwrap();
        assert!(store.get("s1", "k").await.is_none());
    }

    #[tokio::test]
    async fn wipe_only_touches_one_session() {
        let store = store().await;
        store.set("s1", "a", b"1").await.unwrap();
        store.set("s1", "b", b"2").await.unwrap();
        store.set("s2", "a", b"3").await.unwrap();
        assert_eq!(store.wipe("s1").await.unwrap(), 2);
        assert!(store.get("s1", "a").await.is_none());
        assert!(store.get("s2", "a").await.is_some());
    }

    #[tokio::test]
    async fn unreadable_creds_start_fresh() {
        let store = store().await;
        store.set("s1", CREDS_BLOB_ID, b"{not json").await.unwrap();
        let keys = store.for_session("s1");
        assert!(keys.load_creds().await.is_none());

        keys.save_creds(&serde_json::json!({ "registered": true }))
            .await
            .unwrap();
        assert_eq!(keys.load_creds().await.unwrap()["registered"], true);
    }
}
