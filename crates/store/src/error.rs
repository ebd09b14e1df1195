#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}
