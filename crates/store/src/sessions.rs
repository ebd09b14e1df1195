//! Persisted session rows, scanned at startup to resume active sessions.

use {serde::Serialize, sqlx::SqlitePool, switchboard_common::time::now_ms};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub tenant_id: String,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_active_at: Option<i64>,
}

/// SQLite-backed session rows.
#[derive(Clone)]
pub struct SessionRows {
    pool: SqlitePool,
}

impl SessionRows {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `sessions` table if it doesn't exist.
    pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                tenant_id      TEXT NOT NULL,
                active         INTEGER NOT NULL DEFAULT 1,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                last_active_at INTEGER
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS sessions_tenant ON sessions (tenant_id)")
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Insert the row, or re-activate it. The owning tenant never changes.
    pub async fn activate(&self, id: &str, tenant_id: &str) -> Result<(), StoreError> {
        let now = now_ms() as i64;
        sqlx::query(
            r#"INSERT INTO sessions (id, tenant_id, active, created_at, updated_at)
               VALUES (?, ?, 1, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 active = 1,
                 updated_at = excluded.updated_at"#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the row inactive so recovery skips it. Credentials are untouched.
    pub async fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET active = 0, updated_at = ? WHERE id = ?")
            .bind(now_ms() as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(now_ms() as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every active row, oldest first.
    pub async fn list_active(&self) -> Result<Vec<SessionRow>, StoreError> {
        Ok(sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rows() -> SessionRows {
        SessionRows::new(crate::connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn activate_and_list_active() {
        let rows = rows().await;
        rows.activate("s1", "t1").await.unwrap();
        rows.activate("s2", "t1").await.unwrap();
        rows.activate("s3", "t2").await.unwrap();
        rows.deactivate("s2").await.unwrap();

        let active: Vec<String> = rows
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"s1".to_string()));
        assert!(active.contains(&"s3".to_string()));
    }

    #[tokio::test]
    async fn reactivation_keeps_tenant() {
        let rows = rows().await;
        rows.activate("s1", "t1").await.unwrap();
        rows.deactivate("s1").await.unwrap();
        assert!(!rows.get("s1").await.unwrap().unwrap().active);

        rows.activate("s1", "other").await.unwrap();
        let row = rows.get("s1").await.unwrap().unwrap();
        assert!(row.active);
        assert_eq!(row.tenant_id, "t1");
    }

    #[tokio::test]
    async fn touch_and_remove() {
        let rows = rows().await;
        rows.activate("s1", "t1").await.unwrap();
        assert!(rows.get("s1").await.unwrap().unwrap().last_active_at.is_none());
        rows.touch("s1").await.unwrap();
        assert!(rows.get("s1").await.unwrap().unwrap().last_active_at.is_some());
        rows.remove("s1").await.unwrap();
        rows.remove("s1").await.unwrap();
        assert!(rows.get("s1").await.unwrap().is_none());
    }
}
