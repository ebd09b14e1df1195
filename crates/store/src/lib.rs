//! Durable state: credential blobs, session rows and ingested traffic.
//!
//! Everything lives in one sqlite database. Each relation is keyed by
//! `session_id` first; no transaction ever spans more than one session.

pub mod credentials;
pub mod error;
pub mod events;
pub mod ingest;
pub mod memory;
pub mod sessions;

use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

pub use {
    credentials::{CredentialStore, SessionKeys, canonical_blob_id},
    error::StoreError,
    events::{ApplyOutcome, EventStore, StoredChat, StoredContact, StoredMessage},
    ingest::{Backpressure, FlowAction, SessionIngest},
    memory::{MemorySample, MemorySampler, SysinfoSampler},
    sessions::{SessionRow, SessionRows},
};

/// Open (creating if needed) the database in WAL mode and create every
/// relation.
pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    init(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database, used by tests across the workspace.
pub async fn connect_in_memory() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init(&pool).await?;
    Ok(pool)
}

/// Create every relation if missing.
pub async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
    SessionRows::init(pool).await?;
    CredentialStore::init(pool).await?;
    EventStore::init(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("switchboard.db").display());

        let pool = connect(&url).await.unwrap();
        SessionRows::new(pool.clone()).activate("s1", "tenant").await.unwrap();
        pool.close().await;

        let pool = connect(&url).await.unwrap();
        let active = SessionRows::new(pool).list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "s1");
    }
}
